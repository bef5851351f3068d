use glam::DMat3;

use crate::core::error::{Error, Result};
use crate::geom::htm::SphericalTriangle;
use crate::geom::sphere::{cartesian, spherical};
use crate::io::mmap::MappedInputFile;
use crate::map::population::PopulationMap;

/// Maps positions from a source trixel into a destination trixel.
///
/// The transform `M_dst * M_src^-1` carries the source triangle's
/// vertices onto the destination's; applied to a cartesian position it
/// lands the barycentric-equivalent point in the destination trixel.
/// Scale is irrelevant since `v` and `k*v` share spherical coordinates.
pub struct PosMapper {
    m: DMat3,
}

impl PosMapper {
    pub fn identity() -> Self {
        PosMapper { m: DMat3::IDENTITY }
    }

    pub fn new(source_htm_id: u32, destination_htm_id: u32) -> Result<Self> {
        let src = SphericalTriangle::new(source_htm_id)?;
        let dst = SphericalTriangle::new(destination_htm_id)?;
        Ok(PosMapper {
            m: dst.cartesian_transform() * src.barycentric_transform(),
        })
    }

    pub fn map(&self, ra: f64, dec: f64) -> (f64, f64) {
        spherical(self.m * cartesian(ra, dec))
    }
}

/// Maps primary or foreign keys from a source trixel into a destination
/// trixel.
///
/// The key K of a record in trixel H maps to `H' * 2^32 + s(K)` in
/// trixel H', where `s(K)` counts the keys of H smaller than K. The
/// duplication index stores ids sorted by (HTM id, position in the data
/// file), so `s(K)` is the rank of K within H's id slice, found by
/// binary search.
pub struct KeyMapper<'a> {
    /// The packed little-endian i64 ids of the source trixel.
    ids: &'a [u8],
    destination_htm_id: u32,
    field: usize,
}

impl<'a> KeyMapper<'a> {
    pub fn new(
        map: &PopulationMap,
        ids_file: &'a MappedInputFile,
        field: usize,
        source_htm_id: u32,
        destination_htm_id: u32,
    ) -> KeyMapper<'a> {
        let off = 8 * map.num_records_below(source_htm_id) as usize;
        let sz = 8 * map.num_records(source_htm_id) as usize;
        // prefetch the id slice; lookups binary-search all over it
        ids_file.will_need(off, sz);
        KeyMapper {
            ids: &ids_file.data()[off..off + sz],
            destination_htm_id,
            field,
        }
    }

    pub fn field(&self) -> usize {
        self.field
    }

    fn id_at(&self, rank: usize) -> i64 {
        i64::from_le_bytes(self.ids[8 * rank..8 * rank + 8].try_into().unwrap())
    }

    pub fn map(&self, key: i64) -> Result<i64> {
        let n = self.ids.len() / 8;
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.id_at(mid) < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == n || self.id_at(lo) != key {
            return Err(Error::parse(format!(
                "key {} not found in the duplication index",
                key
            )));
        }
        Ok(((self.destination_htm_id as i64) << 32) + lo as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::htm::htm_id;

    #[test]
    fn test_identity_pos_mapper_is_identity() {
        let m = PosMapper::identity();
        let (ra, dec) = m.map(123.25, -41.5);
        assert!((ra - 123.25).abs() < 1e-12);
        assert!((dec + 41.5).abs() < 1e-12);
    }

    #[test]
    fn test_pos_mapper_lands_in_destination_trixel() {
        let level = 4;
        let src = htm_id(cartesian(10.0, 10.0), level).unwrap();
        let dst = htm_id(cartesian(200.0, -30.0), level).unwrap();
        let mapper = PosMapper::new(src, dst).unwrap();
        // points inside the source trixel map into the destination trixel
        for (ra, dec) in [(10.0, 10.0), (10.1, 9.95), (9.9, 10.05)] {
            if htm_id(cartesian(ra, dec), level).unwrap() != src {
                continue;
            }
            let (mra, mdec) = mapper.map(ra, dec);
            assert_eq!(htm_id(cartesian(mra, mdec), level).unwrap(), dst);
        }
    }

    #[test]
    fn test_key_mapper_ranks() {
        let dir = tempfile::TempDir::new().unwrap();
        // trixel 32 holds keys [10, 20, 30]; trixel 33 holds [5]
        let ids_path = dir.path().join("ids.bin");
        let mut raw = Vec::new();
        for id in [10i64, 20, 30, 5] {
            raw.extend_from_slice(&id.to_le_bytes());
        }
        std::fs::write(&ids_path, raw).unwrap();
        let mut map = PopulationMap::new(1).unwrap();
        map.add(32, 3, 24);
        map.add(33, 1, 8);
        map.make_queryable().unwrap();
        let ids = MappedInputFile::open(&ids_path).unwrap();

        let mapper = KeyMapper::new(&map, &ids, 0, 32, 40);
        assert_eq!(mapper.map(10).unwrap(), (40i64 << 32) + 0);
        assert_eq!(mapper.map(20).unwrap(), (40i64 << 32) + 1);
        assert_eq!(mapper.map(30).unwrap(), (40i64 << 32) + 2);
        assert!(mapper.map(15).is_err());

        let mapper33 = KeyMapper::new(&map, &ids, 0, 33, 41);
        assert_eq!(mapper33.map(5).unwrap(), 41i64 << 32);
    }

    #[test]
    fn test_destination_key_spaces_are_disjoint() {
        // keys mapped into distinct destination trixels can never collide
        let h1 = 40i64;
        let h2 = 41i64;
        let max_rank = (u32::MAX as i64) - 1;
        assert!((h1 << 32) + max_rank < (h2 << 32));
    }
}
