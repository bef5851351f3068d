//! Phase-based map-reduce engine for batch CSV processing.
//!
//! A fixed pool of worker threads alternates between two phases. During
//! the map phase, threads repeatedly pop the emptiest silo, read one
//! line-aligned input block and map its records into the silo; a silo
//! that grows past the memory threshold is sorted and parked. When the
//! input runs out or every silo is parked, the pool crosses a barrier
//! into the reduce phase: a merge-scan over all sorted silos visits
//! records in key order, and each worker reduces exactly the records
//! whose key hashes to its rank, so all records with a given key meet in
//! one worker. The cycle repeats until the input is exhausted.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::core::error::{Error, ErrorKind, Result};
use crate::csv::parse::MAX_LINE_SIZE;
use crate::index::block::split_ranges;
use crate::io::file::InputFile;

/// Slab size for silo line storage.
const ALLOC_SIZE: usize = 32 * MAX_LINE_SIZE;

/// Keys order records for the merge-scan and route them to workers.
pub trait RecordKey: Copy + Ord + Send + Sync {
    fn hash(&self) -> u32;
}

/// A record stored in a silo: its key and the (slab, offset, size) of
/// its line text.
#[derive(Debug, Clone, Copy)]
pub struct SiloRecord<K> {
    pub key: K,
    pub size: u32,
    slab: u32,
    offset: u32,
}

/// An append-only record silo: a record list plus slab-backed line
/// storage. Slabs are retained across phases and reused after `clear`.
pub struct Silo<K> {
    records: Vec<SiloRecord<K>>,
    slabs: Vec<Vec<u8>>,
    cur: usize,
    bytes_used: usize,
}

impl<K: RecordKey> Silo<K> {
    fn new() -> Self {
        Silo {
            records: Vec::new(),
            slabs: Vec::new(),
            cur: 0,
            bytes_used: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn records(&self) -> &[SiloRecord<K>] {
        &self.records
    }

    pub fn line(&self, r: &SiloRecord<K>) -> &[u8] {
        &self.slabs[r.slab as usize][r.offset as usize..(r.offset + r.size) as usize]
    }

    pub fn add(&mut self, key: K, data: &[u8]) -> Result<()> {
        if data.len() > MAX_LINE_SIZE {
            return Err(Error::parse("record too long"));
        }
        let fits = self
            .slabs
            .get(self.cur)
            .is_some_and(|s| ALLOC_SIZE - s.len() >= data.len());
        if !fits {
            if self.slabs.get(self.cur).is_some() {
                self.cur += 1;
            }
            if self.slabs.len() <= self.cur {
                self.slabs.push(Vec::with_capacity(ALLOC_SIZE));
            }
        }
        let slab = &mut self.slabs[self.cur];
        let offset = slab.len() as u32;
        slab.extend_from_slice(data);
        self.records.push(SiloRecord {
            key,
            size: data.len() as u32,
            slab: self.cur as u32,
            offset,
        });
        self.bytes_used += data.len() + std::mem::size_of::<SiloRecord<K>>();
        Ok(())
    }

    fn sort(&mut self) {
        self.records.sort_by_key(|r| r.key);
    }

    /// Clear records and line storage without releasing slab memory.
    fn clear(&mut self) {
        self.records.clear();
        for s in &mut self.slabs {
            s.clear();
        }
        self.cur = 0;
        self.bytes_used = 0;
    }
}

/// The worker API of a map-reduce job.
///
/// `map` transforms one input block into keyed records. `reduce` is
/// handed runs of records with equal keys (possibly over several calls,
/// and only for keys hashing to this worker's rank). `finish` marks the
/// end of each reduce phase; buffered output must be flushed there.
/// A worker never runs `map` while any other worker runs `reduce`.
pub trait Worker: Send {
    type Key: RecordKey;

    fn map(&mut self, data: &[u8], silo: &mut Silo<Self::Key>) -> Result<()>;
    fn reduce(&mut self, silo: &Silo<Self::Key>, records: &[SiloRecord<Self::Key>]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

/// Pool sizing and input blocking for a job.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub num_workers: usize,
    /// Soft cap on total silo memory, split evenly across workers.
    pub pool_size: usize,
    pub block_size: usize,
}

struct State<K> {
    silos: Vec<Arc<Silo<K>>>,
    sorted: Vec<Arc<Silo<K>>>,
    input: Vec<(Arc<InputFile>, u64, usize)>,
    input_exhausted: bool,
    num_mappers: usize,
    num_reducers: usize,
    failed: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    map_cond: Condvar,
    reduce_cond: Condvar,
}

/// Run a map-reduce job over the given input files; returns each
/// worker's final state so the caller can merge per-worker results.
pub fn run_job<W, F>(paths: &[PathBuf], config: &JobConfig, make_worker: F) -> Result<Vec<W>>
where
    W: Worker,
    F: Fn() -> Result<W> + Sync,
{
    if config.num_workers < 1 || config.num_workers > 256 {
        return Err(Error::new(
            ErrorKind::Config,
            "the number of workers must lie in [1, 256]".to_string(),
        ));
    }
    if config.block_size < MAX_LINE_SIZE || config.block_size > 1024 * 1024 * 1024 {
        return Err(Error::new(
            ErrorKind::Config,
            "the IO block size must lie between 16 KiB and 1 GiB".to_string(),
        ));
    }
    let mut input = split_ranges(paths, config.block_size)?;
    if input.is_empty() {
        return Err(Error::new(ErrorKind::Config, "no input data".to_string()));
    }
    // pop order should follow file order
    input.reverse();
    let threshold = (config.pool_size / config.num_workers).max(ALLOC_SIZE);
    let shared = Shared {
        state: Mutex::new(State {
            silos: (0..config.num_workers).map(|_| Arc::new(Silo::new())).collect(),
            sorted: Vec::with_capacity(config.num_workers),
            input,
            input_exhausted: false,
            num_mappers: 0,
            num_reducers: 0,
            failed: false,
        }),
        map_cond: Condvar::new(),
        reduce_cond: Condvar::new(),
    };
    let results: Mutex<Vec<W>> = Mutex::new(Vec::with_capacity(config.num_workers));
    let error: Mutex<Option<Error>> = Mutex::new(None);
    let body = || {
        match work(&shared, config.num_workers, threshold, &make_worker) {
            Ok(Some(w)) => results.lock().push(w),
            Ok(None) => {}
            Err(e) => {
                {
                    let mut slot = error.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                }
                shared.state.lock().failed = true;
                shared.map_cond.notify_all();
                shared.reduce_cond.notify_all();
            }
        }
    };
    std::thread::scope(|s| {
        for _ in 1..config.num_workers {
            s.spawn(&body);
        }
        body();
    });
    if let Some(e) = error.into_inner() {
        return Err(e);
    }
    Ok(results.into_inner())
}

/// The per-thread scheduling loop; see the module docs for the phase
/// structure.
fn work<W, F>(
    shared: &Shared<W::Key>,
    num_workers: usize,
    threshold: usize,
    make_worker: &F,
) -> Result<Option<W>>
where
    W: Worker,
    F: Fn() -> Result<W>,
{
    let mut buf: Vec<u8> = Vec::new();
    let mut worker = make_worker()?;
    let mut st = shared.state.lock();
    let rank = st.num_mappers;
    st.num_mappers += 1;
    loop {
        // ---- map phase ----
        loop {
            if st.failed {
                return Ok(None);
            }
            // grab the emptiest silo
            let Some(pos) = st
                .silos
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.bytes_used())
                .map(|(i, _)| i)
            else {
                break;
            };
            let mut silo_arc = st.silos.swap_remove(pos);
            let range = st.input.pop();
            if range.is_none() {
                st.input_exhausted = true;
            }
            drop(st);
            let silo =
                Arc::get_mut(&mut silo_arc).expect("silo is uniquely held during the map phase");
            match range {
                None => {
                    silo.sort();
                    st = shared.state.lock();
                    st.sorted.push(silo_arc);
                }
                Some((file, offset, size)) => {
                    buf.resize(size, 0);
                    file.read_at(&mut buf, offset)?;
                    worker.map(&buf, silo)?;
                    let full = silo.bytes_used() > threshold;
                    if full {
                        silo.sort();
                    }
                    st = shared.state.lock();
                    if full {
                        st.sorted.push(silo_arc);
                    } else {
                        st.silos.push(silo_arc);
                    }
                }
            }
        }
        // barrier: wait for all workers to enter reduce
        st.num_reducers += 1;
        if st.num_reducers == num_workers {
            st.num_mappers = 0;
        } else {
            while st.num_reducers != num_workers && !st.failed {
                shared.reduce_cond.wait(&mut st);
            }
            if st.failed {
                return Ok(None);
            }
        }
        shared.reduce_cond.notify_one();
        let snapshot: Vec<Arc<Silo<W::Key>>> = st.sorted.clone();
        let exhausted = st.input_exhausted;
        drop(st);

        // ---- reduce phase ----
        reduce_scan(&snapshot, rank, num_workers, &mut worker)?;
        worker.finish()?;
        drop(snapshot);

        st = shared.state.lock();
        if exhausted {
            return Ok(Some(worker));
        }
        // barrier: wait for all workers to finish reducing, then recycle
        // the silos for the next map phase
        st.num_mappers += 1;
        if st.num_mappers == num_workers {
            let mut silos = std::mem::take(&mut st.sorted);
            for s in &mut silos {
                Arc::get_mut(s)
                    .expect("silo snapshots are dropped before the map barrier")
                    .clear();
            }
            st.silos = silos;
            st.num_reducers = 0;
        } else {
            while st.num_mappers != num_workers && !st.failed {
                shared.map_cond.wait(&mut st);
            }
            if st.failed {
                return Ok(None);
            }
        }
        shared.map_cond.notify_one();
    }
}

/// Merge-scan all sorted silos, reducing runs of equal keys that hash to
/// this worker's rank.
fn reduce_scan<W: Worker>(
    silos: &[Arc<Silo<W::Key>>],
    rank: usize,
    num_workers: usize,
    worker: &mut W,
) -> Result<()> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    struct Range {
        silo: usize,
        cur: usize,
        end: usize,
    }
    let mut ranges = Vec::new();
    let mut heap = BinaryHeap::new();
    for (i, s) in silos.iter().enumerate() {
        if s.is_empty() {
            continue;
        }
        heap.push(Reverse((s.records()[0].key, ranges.len())));
        ranges.push(Range {
            silo: i,
            cur: 0,
            end: s.len(),
        });
    }
    while let Some(Reverse((key, ri))) = heap.pop() {
        let r = &mut ranges[ri];
        let silo = &silos[r.silo];
        let records = silo.records();
        // advance past the run of equal keys
        let mut run_end = r.cur + 1;
        while run_end < r.end && records[run_end].key == key {
            run_end += 1;
        }
        if key.hash() as usize % num_workers == rank {
            worker.reduce(silo, &records[r.cur..run_end])?;
        }
        r.cur = run_end;
        if r.cur < r.end {
            heap.push(Reverse((records[r.cur].key, ri)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::mulvey_hash;
    use std::collections::HashMap;

    impl RecordKey for u32 {
        fn hash(&self) -> u32 {
            mulvey_hash(*self)
        }
    }

    /// Counts reduced lines per key.
    struct CountWorker {
        counts: HashMap<u32, u64>,
        finishes: usize,
    }

    impl Worker for CountWorker {
        type Key = u32;

        fn map(&mut self, data: &[u8], silo: &mut Silo<u32>) -> Result<()> {
            for line in data.split(|&c| c == b'\n') {
                if line.is_empty() {
                    continue;
                }
                let key: u32 = std::str::from_utf8(line)
                    .unwrap()
                    .trim()
                    .parse()
                    .map_err(|_| Error::parse("bad key"))?;
                silo.add(key, line)?;
            }
            Ok(())
        }

        fn reduce(&mut self, silo: &Silo<u32>, records: &[SiloRecord<u32>]) -> Result<()> {
            for r in records {
                assert_eq!(silo.line(r).len() as u32, r.size);
                *self.counts.entry(r.key).or_default() += 1;
            }
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finishes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_all_records_of_a_key_meet_in_one_worker() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("in.txt");
        let mut text = String::new();
        for i in 0..5000u32 {
            text.push_str(&format!("{}\n", i % 97));
        }
        std::fs::write(&path, text).unwrap();

        let config = JobConfig {
            num_workers: 4,
            pool_size: 64 * ALLOC_SIZE,
            block_size: 64 * 1024,
        };
        let workers = run_job(&[path], &config, || {
            Ok(CountWorker {
                counts: HashMap::new(),
                finishes: 0,
            })
        })
        .unwrap();
        assert_eq!(workers.len(), 4);
        let mut totals: HashMap<u32, u64> = HashMap::new();
        for w in &workers {
            assert!(w.finishes >= 1);
            for (k, n) in &w.counts {
                *totals.entry(*k).or_default() += n;
            }
        }
        // every record was reduced exactly once
        for k in 0..97u32 {
            let expect = (5000 + 96 - k as u64) / 97;
            assert_eq!(totals[&k], expect, "key {}", k);
        }
        // and no key appears in two workers
        let mut seen = std::collections::HashSet::new();
        for w in &workers {
            for k in w.counts.keys() {
                assert!(seen.insert(*k), "key {} reduced by two workers", k);
            }
        }
    }

    #[test]
    fn test_map_error_fails_the_job() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, "not-a-number\n").unwrap();
        let config = JobConfig {
            num_workers: 2,
            pool_size: 4 * ALLOC_SIZE,
            block_size: 64 * 1024,
        };
        let result = run_job(&[path], &config, || {
            Ok(CountWorker {
                counts: HashMap::new(),
                finishes: 0,
            })
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_silo_reuse_after_clear() {
        let mut silo: Silo<u32> = Silo::new();
        silo.add(5, b"hello").unwrap();
        assert_eq!(silo.len(), 1);
        assert!(silo.bytes_used() > 0);
        silo.clear();
        assert!(silo.is_empty());
        assert_eq!(silo.bytes_used(), 0);
        silo.add(6, b"world").unwrap();
        assert_eq!(silo.line(&silo.records()[0]), b"world");
    }
}
