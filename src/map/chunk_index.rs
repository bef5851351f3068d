use std::collections::HashMap;
use std::path::Path;

use crate::core::error::{Error, Result};
use crate::geom::chunker::{ChunkLocation, LocationKind, NUM_LOCATION_KINDS};
use crate::io::file::{InputFile, OutputFile};

/// Record counts per location kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Entry {
    pub num_records: [u64; NUM_LOCATION_KINDS],
}

impl Entry {
    pub fn total(&self) -> u64 {
        self.num_records.iter().sum()
    }

    fn merge(&mut self, other: &Entry) {
        for i in 0..NUM_LOCATION_KINDS {
            self.num_records[i] += other.num_records[i];
        }
    }
}

/// Serialized entry: chunk id, sub-chunk id, three record counts.
const ENTRY_SIZE: usize = 4 + 4 + 8 * NUM_LOCATION_KINDS;

/// Tracks how many records, self-overlap records and full-overlap records
/// fall into each chunk and sub-chunk of a partitioned data set.
///
/// The binary format stores sub-chunk granularity entries; per-chunk
/// rollups are rebuilt on read. Concatenating two index files derived
/// from identical partitioning parameters yields a valid index equal to
/// the merge of the two.
#[derive(Default)]
pub struct ChunkIndex {
    chunks: HashMap<i32, Entry>,
    sub_chunks: HashMap<i64, Entry>,
}

fn key(chunk_id: i32, sub_chunk_id: i32) -> i64 {
    ((chunk_id as i64) << 32) + sub_chunk_id as i64
}

impl ChunkIndex {
    pub fn new() -> Self {
        ChunkIndex::default()
    }

    /// Read a chunk index from a file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let mut idx = ChunkIndex::new();
        idx.read_into(path.as_ref())?;
        Ok(idx)
    }

    /// Read and merge a list of chunk index files.
    pub fn read_many(paths: &[impl AsRef<Path>]) -> Result<Self> {
        let mut idx = ChunkIndex::new();
        for p in paths {
            idx.read_into(p.as_ref())?;
        }
        Ok(idx)
    }

    fn read_into(&mut self, path: &Path) -> Result<()> {
        let f = InputFile::open(path)?;
        let size = f.size() as usize;
        if size % ENTRY_SIZE != 0 {
            return Err(Error::parse("invalid chunk index file"));
        }
        let mut data = vec![0u8; size];
        f.read_at(&mut data, 0)?;
        for entry in data.chunks_exact(ENTRY_SIZE) {
            let chunk_id = i32::from_le_bytes(entry[0..4].try_into().unwrap());
            let sub_chunk_id = i32::from_le_bytes(entry[4..8].try_into().unwrap());
            let mut e = Entry::default();
            for k in 0..NUM_LOCATION_KINDS {
                e.num_records[k] =
                    u64::from_le_bytes(entry[8 + 8 * k..16 + 8 * k].try_into().unwrap());
            }
            self.chunks.entry(chunk_id).or_default().merge(&e);
            self.sub_chunks
                .entry(key(chunk_id, sub_chunk_id))
                .or_default()
                .merge(&e);
        }
        Ok(())
    }

    /// Add `n` records with the given location.
    pub fn add(&mut self, loc: &ChunkLocation, n: u64) {
        let k = loc.kind.index();
        self.chunks.entry(loc.chunk_id).or_default().num_records[k] += n;
        self.sub_chunks
            .entry(key(loc.chunk_id, loc.sub_chunk_id))
            .or_default()
            .num_records[k] += n;
    }

    /// Record count for an exact location.
    pub fn num_records(&self, loc: &ChunkLocation) -> u64 {
        self.sub_chunks
            .get(&key(loc.chunk_id, loc.sub_chunk_id))
            .map_or(0, |e| e.num_records[loc.kind.index()])
    }

    /// Record counts for a chunk.
    pub fn chunk(&self, chunk_id: i32) -> Entry {
        self.chunks.get(&chunk_id).copied().unwrap_or_default()
    }

    /// Record counts for a sub-chunk.
    pub fn sub_chunk(&self, chunk_id: i32, sub_chunk_id: i32) -> Entry {
        self.sub_chunks
            .get(&key(chunk_id, sub_chunk_id))
            .copied()
            .unwrap_or_default()
    }

    /// Number of non-empty chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn merge(&mut self, other: &ChunkIndex) {
        for (id, e) in &other.chunks {
            self.chunks.entry(*id).or_default().merge(e);
        }
        for (k, e) in &other.sub_chunks {
            self.sub_chunks.entry(*k).or_default().merge(e);
        }
    }

    /// Write or append the index to a binary file.
    pub fn write(&self, path: impl AsRef<Path>, truncate: bool) -> Result<()> {
        let mut keys: Vec<i64> = self.sub_chunks.keys().copied().collect();
        keys.sort_unstable();
        let mut buf = Vec::with_capacity(keys.len() * ENTRY_SIZE);
        for k in keys {
            let e = &self.sub_chunks[&k];
            buf.extend_from_slice(&((k >> 32) as i32).to_le_bytes());
            buf.extend_from_slice(&(k as i32).to_le_bytes());
            for n in e.num_records {
                buf.extend_from_slice(&n.to_le_bytes());
            }
        }
        let mut f = if truncate {
            OutputFile::create(path.as_ref())?
        } else {
            OutputFile::append_to(path.as_ref())?
        };
        f.append(&buf)
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.sub_chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(chunk_id: i32, sub_chunk_id: i32, kind: LocationKind) -> ChunkLocation {
        ChunkLocation {
            chunk_id,
            sub_chunk_id,
            kind,
        }
    }

    #[test]
    fn test_add_and_roll_up() {
        let mut idx = ChunkIndex::new();
        idx.add(&loc(7, 0, LocationKind::Chunk), 5);
        idx.add(&loc(7, 1, LocationKind::Chunk), 2);
        idx.add(&loc(7, 1, LocationKind::SelfOverlap), 1);
        idx.add(&loc(8, 0, LocationKind::FullOverlap), 3);
        assert_eq!(idx.chunk(7).num_records[0], 7);
        assert_eq!(idx.chunk(7).num_records[1], 1);
        assert_eq!(idx.sub_chunk(7, 1).num_records[0], 2);
        assert_eq!(idx.num_records(&loc(8, 0, LocationKind::FullOverlap)), 3);
        assert_eq!(idx.num_records(&loc(8, 0, LocationKind::Chunk)), 0);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_concatenation_equals_merge() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chunk_index.bin");
        let mut a = ChunkIndex::new();
        a.add(&loc(1, 0, LocationKind::Chunk), 10);
        a.add(&loc(2, 3, LocationKind::SelfOverlap), 4);
        let mut b = ChunkIndex::new();
        b.add(&loc(1, 0, LocationKind::Chunk), 1);
        b.add(&loc(5, 0, LocationKind::FullOverlap), 6);
        a.write(&path, true).unwrap();
        b.write(&path, false).unwrap();

        let from_file = ChunkIndex::read(&path).unwrap();
        let mut merged = ChunkIndex::new();
        merged.merge(&a);
        merged.merge(&b);
        for (chunk, sub) in [(1, 0), (2, 3), (5, 0)] {
            assert_eq!(from_file.sub_chunk(chunk, sub), merged.sub_chunk(chunk, sub));
            assert_eq!(from_file.chunk(chunk), merged.chunk(chunk));
        }
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.bin");
        std::fs::write(&path, vec![0u8; ENTRY_SIZE - 1]).unwrap();
        assert!(ChunkIndex::read(&path).is_err());
    }
}
