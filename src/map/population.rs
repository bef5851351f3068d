use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::hash::mulvey_hash;
use crate::geom::htm::{HTM_MAX_LEVEL, htm_level, num_triangles};
use crate::io::file::{InputFile, OutputFile};

/// A population map of the sky.
///
/// Tracks the number of records and CSV bytes per trixel of an HTM-sorted
/// data file, provides prefix sums over both, and maps any trixel to a
/// non-empty one.
///
/// Instances are in one of two states: in-construction or queryable. A
/// map read from a file starts queryable; one built via `add` becomes
/// queryable after `make_queryable`. While in-construction, `add` may be
/// called from any number of threads.
pub struct PopulationMap {
    num_trix: u32,
    level: i32,
    queryable: bool,
    /// Raw per-trixel record counts while building, then a prefix sum.
    /// Slot 0 stays zero; trixel id maps to slot `id - num_trix + 1`.
    count: Vec<AtomicU64>,
    offset: Vec<AtomicU64>,
    non_empty: Vec<u32>,
}

impl PopulationMap {
    /// Create an empty, in-construction population map.
    pub fn new(level: i32) -> Result<Self> {
        if !(0..=HTM_MAX_LEVEL).contains(&level) {
            return Err(Error::new(
                ErrorKind::Config,
                format!("invalid HTM subdivision level: {}", level),
            ));
        }
        let num_trix = num_triangles(level);
        let mut count = Vec::with_capacity(num_trix as usize + 1);
        let mut offset = Vec::with_capacity(num_trix as usize + 1);
        for _ in 0..=num_trix {
            count.push(AtomicU64::new(0));
            offset.push(AtomicU64::new(0));
        }
        Ok(PopulationMap {
            num_trix,
            level,
            queryable: false,
            count,
            offset,
            non_empty: Vec::new(),
        })
    }

    /// Read a population map from a file. The result is queryable.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let f = InputFile::open(path.as_ref())?;
        let size = f.size();
        if size % 4 != 0 || size < 8 {
            return Err(Error::parse("invalid population map file"));
        }
        let mut buf = vec![0u8; size as usize];
        f.read_at(&mut buf, 0)?;
        let word = |i: usize| -> u32 {
            u32::from_le_bytes(buf[4 * i..4 * i + 4].try_into().unwrap())
        };
        let num_trix = word(0);
        // the number of level-L trixels equals the smallest level-L id
        let level = htm_level(num_trix);
        if level < 0 {
            return Err(Error::parse("invalid population map file"));
        }
        let n = word(1);
        if size != (3 * n as u64 + 2) * 4 || n > num_trix {
            return Err(Error::parse("invalid population map file"));
        }
        let mut map = PopulationMap::new(level)?;
        for i in 0..n as usize {
            let id = word(3 * i + 2);
            if id < num_trix || id >= 2 * num_trix {
                return Err(Error::parse("invalid population map file"));
            }
            let slot = (id - num_trix + 1) as usize;
            map.count[slot].store(word(3 * i + 3) as u64, Ordering::Relaxed);
            map.offset[slot].store(word(3 * i + 4) as u64, Ordering::Relaxed);
        }
        map.make_queryable()?;
        Ok(map)
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn num_trixels(&self) -> u32 {
        self.num_trix
    }

    /// Add records occupying `size` bytes to a trixel. Only legal while
    /// the map is in-construction.
    pub fn add(&self, id: u32, num_records: u64, size: u64) {
        assert!(!self.queryable, "add() on a queryable population map");
        let slot = (id - self.num_trix + 1) as usize;
        self.count[slot].fetch_add(num_records, Ordering::Relaxed);
        self.offset[slot].fetch_add(size, Ordering::Relaxed);
    }

    /// Transition to the queryable state.
    pub fn make_queryable(&mut self) -> Result<()> {
        if self.queryable {
            return Ok(());
        }
        for i in 1..=self.num_trix as usize {
            if self.count[i].load(Ordering::Relaxed) > u32::MAX as u64 {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "trixel contains more than 2^32 - 1 records; \
                     the HTM subdivision level must be increased"
                        .to_string(),
                ));
            }
            if self.offset[i].load(Ordering::Relaxed) > u32::MAX as u64 {
                return Err(Error::new(
                    ErrorKind::InvalidState,
                    "trixel data is larger than 2^32 - 1 bytes; \
                     the HTM subdivision level must be increased"
                        .to_string(),
                ));
            }
        }
        for i in 1..=self.num_trix as usize {
            if self.count[i].load(Ordering::Relaxed) != 0 {
                self.non_empty.push(i as u32 - 1 + self.num_trix);
            }
            let c = self.count[i - 1].load(Ordering::Relaxed);
            self.count[i].fetch_add(c, Ordering::Relaxed);
            let o = self.offset[i - 1].load(Ordering::Relaxed);
            self.offset[i].fetch_add(o, Ordering::Relaxed);
        }
        self.queryable = true;
        Ok(())
    }

    fn assert_queryable(&self) {
        assert!(self.queryable, "population map is still in-construction");
    }

    fn slot(&self, id: u32) -> usize {
        (id - self.num_trix) as usize
    }

    /// Total number of records in the map.
    pub fn total_records(&self) -> u64 {
        self.assert_queryable();
        self.count[self.num_trix as usize].load(Ordering::Relaxed)
    }

    /// Number of records in a trixel.
    pub fn num_records(&self, id: u32) -> u32 {
        self.assert_queryable();
        let s = self.slot(id);
        (self.count[s + 1].load(Ordering::Relaxed) - self.count[s].load(Ordering::Relaxed)) as u32
    }

    /// Number of records with HTM id less than `id`.
    pub fn num_records_below(&self, id: u32) -> u64 {
        self.assert_queryable();
        self.count[self.slot(id)].load(Ordering::Relaxed)
    }

    /// Total size of all CSV records in the map.
    pub fn total_size(&self) -> u64 {
        self.assert_queryable();
        self.offset[self.num_trix as usize].load(Ordering::Relaxed)
    }

    /// Size in bytes of the CSV records of a trixel.
    pub fn size(&self, id: u32) -> u32 {
        self.assert_queryable();
        let s = self.slot(id);
        (self.offset[s + 1].load(Ordering::Relaxed) - self.offset[s].load(Ordering::Relaxed)) as u32
    }

    /// Byte offset of the first CSV record of a trixel in the data file.
    pub fn offset(&self, id: u32) -> u64 {
        self.assert_queryable();
        self.offset[self.slot(id)].load(Ordering::Relaxed)
    }

    pub fn num_non_empty(&self) -> usize {
        self.assert_queryable();
        self.non_empty.len()
    }

    /// Map a trixel to a non-empty trixel. Empty trixels spread over the
    /// non-empty ones through the Mulvey mix, so the assignment is
    /// deterministic and load-balanced.
    pub fn map_to_non_empty(&self, id: u32) -> u32 {
        self.assert_queryable();
        if self.num_records(id) != 0 {
            return id;
        }
        assert!(!self.non_empty.is_empty(), "population map is empty");
        self.non_empty[mulvey_hash(id) as usize % self.non_empty.len()]
    }

    /// Write the map: a little-endian u32 stream
    /// `[num_triangles, num_non_empty, (id, num_records, size)*]`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        self.assert_queryable();
        let mut buf = Vec::with_capacity((3 * self.non_empty.len() + 2) * 4);
        buf.extend_from_slice(&self.num_trix.to_le_bytes());
        buf.extend_from_slice(&(self.non_empty.len() as u32).to_le_bytes());
        for &id in &self.non_empty {
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&self.num_records(id).to_le_bytes());
            buf.extend_from_slice(&self.size(id).to_le_bytes());
        }
        let mut f = OutputFile::create(path.as_ref())?;
        f.append(&buf)?;
        log::info!(
            "population map: {} non-empty of {} trixels, {} records",
            self.non_empty.len(),
            self.num_trix,
            self.total_records()
        );
        Ok(())
    }
}
