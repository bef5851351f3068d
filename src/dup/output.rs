use crate::core::error::{Error, Result};
use crate::csv::parse::MAX_LINE_SIZE;
use crate::geom::chunker::ChunkLocation;

const LINE_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// An arena of line text, growing in 4 MiB slabs. Records address their
/// line as a (slab, offset) pair, so the arena can grow without moving
/// previously stored lines.
pub struct LineArena {
    slabs: Vec<Vec<u8>>,
}

impl LineArena {
    pub fn new() -> Self {
        LineArena { slabs: Vec::new() }
    }

    pub fn add(&mut self, line: &[u8]) -> Result<(u32, u32)> {
        if line.len() > MAX_LINE_SIZE {
            return Err(Error::parse("output line too long"));
        }
        let need_new = match self.slabs.last() {
            None => true,
            Some(s) => LINE_BLOCK_SIZE - s.len() < line.len(),
        };
        if need_new {
            self.slabs.push(Vec::with_capacity(LINE_BLOCK_SIZE));
        }
        let slab = self.slabs.len() - 1;
        let buf = &mut self.slabs[slab];
        let offset = buf.len();
        buf.extend_from_slice(line);
        Ok((slab as u32, offset as u32))
    }

    pub fn get(&self, slab: u32, offset: u32, length: u32) -> &[u8] {
        &self.slabs[slab as usize][offset as usize..(offset + length) as usize]
    }
}

impl Default for LineArena {
    fn default() -> Self {
        LineArena::new()
    }
}

/// An output chunk record addressing its line text in the owning block's
/// arena.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRecord {
    pub loc: ChunkLocation,
    pub sort_key: i64,
    pub length: u32,
    pub slab: u32,
    pub offset: u32,
}

/// A list of output chunk records plus the arena owning their text.
pub struct OutputBlock {
    records: Vec<ChunkRecord>,
    arena: LineArena,
}

impl OutputBlock {
    pub fn new() -> Self {
        OutputBlock {
            records: Vec::with_capacity(8192),
            arena: LineArena::new(),
        }
    }

    pub fn add(&mut self, loc: ChunkLocation, sort_key: i64, line: &[u8]) -> Result<()> {
        let (slab, offset) = self.arena.add(line)?;
        self.records.push(ChunkRecord {
            loc,
            sort_key,
            length: line.len() as u32,
            slab,
            offset,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Order records by (sub-chunk, secondary sort key) so blocks can be
    /// consumed as sorted runs by the output merge.
    pub fn sort(&mut self) {
        self.records
            .sort_by_key(|r| (r.loc.sub_chunk_id, r.sort_key));
    }

    pub fn records(&self) -> &[ChunkRecord] {
        &self.records
    }

    pub fn line(&self, r: &ChunkRecord) -> &[u8] {
        self.arena.get(r.slab, r.offset, r.length)
    }
}

impl Default for OutputBlock {
    fn default() -> Self {
        OutputBlock::new()
    }
}
