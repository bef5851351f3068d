use std::collections::HashMap;
use std::path::Path;

use crate::core::error::{Error, Result};
use crate::core::hash::mulvey_hash;
use crate::geom::htm::{HTM_MAX_LEVEL, htm_level};
use crate::io::file::{InputFile, OutputFile};

/// Per-triangle record statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Triangle {
    pub id: u32,
    pub num_records: u64,
    pub record_size: u64,
}

/// Serialized entry: level byte, id, record count, byte size.
const ENTRY_SIZE: usize = 1 + 4 + 8 + 8;

/// An incremental per-trixel summary of a partitioned data set.
///
/// Unlike the population map, an HtmIndex carries no file offsets and can
/// be built and merged incrementally: the on-disk format consists of
/// independent fixed-size entries, so concatenating two index files
/// produces a valid index equivalent to their merge.
pub struct HtmIndex {
    level: i32,
    num_records: u64,
    record_size: u64,
    map: HashMap<u32, Triangle>,
    /// Sorted non-empty ids; rebuilt on demand and cleared whenever a
    /// new id appears.
    keys: Vec<u32>,
}

impl HtmIndex {
    pub fn new(level: i32) -> Result<Self> {
        if !(0..=HTM_MAX_LEVEL).contains(&level) {
            return Err(Error::config(format!(
                "invalid HTM subdivision level: {}",
                level
            )));
        }
        Ok(HtmIndex {
            level,
            num_records: 0,
            record_size: 0,
            map: HashMap::new(),
            keys: Vec::new(),
        })
    }

    /// Read an index from a file, or several files merged together.
    pub fn read_many(paths: &[impl AsRef<Path>]) -> Result<Self> {
        if paths.is_empty() {
            return Err(Error::config("empty HTM index file list"));
        }
        let mut idx: Option<HtmIndex> = None;
        for p in paths {
            let one = Self::read_file(p.as_ref(), idx.as_ref().map(|i| i.level))?;
            match idx.as_mut() {
                None => idx = Some(one),
                Some(i) => i.merge(&one)?,
            }
        }
        Ok(idx.unwrap())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        Self::read_file(path.as_ref(), None)
    }

    fn read_file(path: &Path, expect_level: Option<i32>) -> Result<Self> {
        let f = InputFile::open(path)?;
        let size = f.size() as usize;
        if size == 0 || size % ENTRY_SIZE != 0 {
            return Err(Error::parse("invalid HTM index file"));
        }
        let mut data = vec![0u8; size];
        f.read_at(&mut data, 0)?;
        let mut idx: Option<HtmIndex> = None;
        for entry in data.chunks_exact(ENTRY_SIZE) {
            let level = entry[0] as i32;
            let id = u32::from_le_bytes(entry[1..5].try_into().unwrap());
            let num_records = u64::from_le_bytes(entry[5..13].try_into().unwrap());
            let record_size = u64::from_le_bytes(entry[13..21].try_into().unwrap());
            if htm_level(id) != level {
                return Err(Error::parse("invalid HTM index file"));
            }
            if expect_level.is_some_and(|e| e != level) {
                return Err(Error::parse("HTM index subdivision levels do not match"));
            }
            if idx.is_none() {
                idx = Some(HtmIndex::new(level)?);
            }
            idx.as_mut().unwrap().merge_triangle(&Triangle {
                id,
                num_records,
                record_size,
            })?;
        }
        idx.ok_or_else(|| Error::parse("invalid HTM index file"))
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn total_records(&self) -> u64 {
        self.num_records
    }

    pub fn total_size(&self) -> u64 {
        self.record_size
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn triangle(&self, id: u32) -> Option<&Triangle> {
        self.map.get(&id)
    }

    /// Fold one triangle's statistics into the index.
    pub fn merge_triangle(&mut self, tri: &Triangle) -> Result<&Triangle> {
        if htm_level(tri.id) != self.level {
            return Err(Error::parse(
                "HTM id is invalid or has an inconsistent subdivision level",
            ));
        }
        if tri.num_records == 0 || tri.record_size == 0 {
            return Err(Error::parse(
                "updating an HTM index with empty triangles is not allowed",
            ));
        }
        let t = self.map.entry(tri.id).or_insert_with(|| {
            Triangle {
                id: tri.id,
                num_records: 0,
                record_size: 0,
            }
        });
        if t.num_records == 0 {
            self.keys.clear();
        }
        t.num_records += tri.num_records;
        t.record_size += tri.record_size;
        self.num_records += tri.num_records;
        self.record_size += tri.record_size;
        Ok(t)
    }

    pub fn merge(&mut self, other: &HtmIndex) -> Result<()> {
        if other.level != self.level {
            return Err(Error::parse("HTM index subdivision levels do not match"));
        }
        for tri in other.map.values() {
            self.merge_triangle(tri)?;
        }
        Ok(())
    }

    /// Map any id of the index's level to a non-empty triangle.
    pub fn map_to_non_empty(&mut self, id: u32) -> Result<&Triangle> {
        if self.map.is_empty() {
            return Err(Error::new(
                crate::core::error::ErrorKind::InvalidState,
                "HTM index is empty".to_string(),
            ));
        }
        if self.map.contains_key(&id) {
            return Ok(&self.map[&id]);
        }
        if self.keys.is_empty() {
            self.keys = self.map.keys().copied().collect();
            self.keys.sort_unstable();
        }
        let key = self.keys[mulvey_hash(id) as usize % self.keys.len()];
        Ok(&self.map[&key])
    }

    /// Write or append the index to a binary file.
    pub fn write(&self, path: impl AsRef<Path>, truncate: bool) -> Result<()> {
        let mut buf = Vec::with_capacity(self.map.len() * ENTRY_SIZE);
        let mut ids: Vec<u32> = self.map.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let t = &self.map[&id];
            buf.push(self.level as u8);
            buf.extend_from_slice(&t.id.to_le_bytes());
            buf.extend_from_slice(&t.num_records.to_le_bytes());
            buf.extend_from_slice(&t.record_size.to_le_bytes());
        }
        let mut f = if truncate {
            OutputFile::create(path.as_ref())?
        } else {
            OutputFile::append_to(path.as_ref())?
        };
        f.append(&buf)
    }

    pub fn clear(&mut self) {
        self.num_records = 0;
        self.record_size = 0;
        self.map.clear();
        self.keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri(id: u32, n: u64, sz: u64) -> Triangle {
        Triangle {
            id,
            num_records: n,
            record_size: sz,
        }
    }

    #[test]
    fn test_merge_accumulates() {
        let mut idx = HtmIndex::new(1).unwrap();
        idx.merge_triangle(&tri(32, 2, 20)).unwrap();
        idx.merge_triangle(&tri(32, 3, 30)).unwrap();
        idx.merge_triangle(&tri(47, 1, 10)).unwrap();
        assert_eq!(idx.total_records(), 6);
        assert_eq!(idx.triangle(32).unwrap().num_records, 5);
        assert_eq!(idx.len(), 2);
        assert!(idx.merge_triangle(&tri(32, 0, 0)).is_err());
        assert!(idx.merge_triangle(&tri(1, 1, 1)).is_err());
    }

    #[test]
    fn test_map_to_non_empty_uses_mulvey_mix() {
        let mut idx = HtmIndex::new(1).unwrap();
        for id in [32u32, 33, 47] {
            idx.merge_triangle(&tri(id, 1, 8)).unwrap();
        }
        assert_eq!(idx.map_to_non_empty(33).unwrap().id, 33);
        let keys = [32u32, 33, 47];
        let expect = keys[mulvey_hash(40) as usize % 3];
        assert_eq!(idx.map_to_non_empty(40).unwrap().id, expect);
    }

    #[test]
    fn test_concatenated_files_merge() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("htm_index.bin");
        let mut a = HtmIndex::new(2).unwrap();
        a.merge_triangle(&tri(128, 4, 44)).unwrap();
        a.merge_triangle(&tri(130, 1, 11)).unwrap();
        let mut b = HtmIndex::new(2).unwrap();
        b.merge_triangle(&tri(128, 6, 66)).unwrap();
        b.merge_triangle(&tri(200, 2, 22)).unwrap();
        a.write(&path, true).unwrap();
        b.write(&path, false).unwrap();

        let merged = HtmIndex::read(&path).unwrap();
        assert_eq!(merged.level(), 2);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.triangle(128).unwrap().num_records, 10);
        assert_eq!(merged.triangle(128).unwrap().record_size, 110);
        assert_eq!(merged.triangle(200).unwrap().num_records, 2);
        assert_eq!(merged.total_records(), 13);
    }

    #[test]
    fn test_read_many_merges_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let p1 = dir.path().join("a.bin");
        let p2 = dir.path().join("b.bin");
        let mut a = HtmIndex::new(3).unwrap();
        a.merge_triangle(&tri(512, 1, 10)).unwrap();
        a.write(&p1, true).unwrap();
        let mut b = HtmIndex::new(3).unwrap();
        b.merge_triangle(&tri(512, 2, 20)).unwrap();
        b.write(&p2, true).unwrap();
        let merged = HtmIndex::read_many(&[p1, p2]).unwrap();
        assert_eq!(merged.triangle(512).unwrap().num_records, 3);
    }

    #[test]
    fn test_mismatched_levels_are_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let p1 = dir.path().join("a.bin");
        let p2 = dir.path().join("b.bin");
        let mut a = HtmIndex::new(1).unwrap();
        a.merge_triangle(&tri(33, 1, 10)).unwrap();
        a.write(&p1, true).unwrap();
        let mut b = HtmIndex::new(2).unwrap();
        b.merge_triangle(&tri(130, 1, 10)).unwrap();
        b.write(&p2, true).unwrap();
        assert!(HtmIndex::read_many(&[p1, p2]).is_err());
    }
}
