use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::mem;
use std::path::{Path, PathBuf};

use parking_lot::{Condvar, Mutex};

use crate::core::error::{Error, ErrorKind, Result};
use crate::index::block::{InputBlock, RECORD_INFO_SIZE, RecordInfo};
use crate::io::mmap::MappedInputFile;
use crate::io::writer::BlockWriter;

/// Sliding advice window over memory-mapped scratch runs.
const MERGE_WINDOW: usize = 2 * 1024 * 1024;

struct MergeState {
    queue: Vec<InputBlock>,
    remaining: usize,
    merging: bool,
}

struct MergeOutput {
    data: BlockWriter,
    ids: BlockWriter,
    scratch: Option<BlockWriter>,
    scratch_path: PathBuf,
    scratch_blocks: Vec<(u64, u64)>,
}

/// K-way merger producing the HTM-sorted `data.csv` and the parallel
/// `ids.bin` stream of primary keys.
///
/// Parse threads push sorted input blocks; once k blocks accumulate (or
/// the inputs are exhausted) exactly one of them becomes the merge thread
/// while the others continue parsing. If there are more input blocks than
/// k, intermediate runs spill to a scratch file with fixed record headers
/// and a final memory-mapped pass merges them.
pub struct Merger {
    k: usize,
    state: Mutex<MergeState>,
    full_cond: Condvar,
    merge_cond: Condvar,
    output: Mutex<MergeOutput>,
}

impl Merger {
    pub fn new(
        data_path: impl AsRef<Path>,
        id_path: impl AsRef<Path>,
        scratch_path: impl AsRef<Path>,
        block_size: usize,
        k: usize,
        num_input_blocks: usize,
    ) -> Result<Self> {
        if k < 2 {
            return Err(Error::new(
                ErrorKind::Config,
                "merge factor k must be >= 2".to_string(),
            ));
        }
        if num_input_blocks == 0 {
            return Err(Error::new(ErrorKind::Config, "no input blocks".to_string()));
        }
        let scratch_path = scratch_path.as_ref().to_path_buf();
        let scratch = if num_input_blocks > k {
            Some(BlockWriter::new(&scratch_path, block_size)?)
        } else {
            None
        };
        Ok(Merger {
            k,
            state: Mutex::new(MergeState {
                queue: Vec::with_capacity(k),
                remaining: num_input_blocks,
                merging: false,
            }),
            full_cond: Condvar::new(),
            merge_cond: Condvar::new(),
            output: Mutex::new(MergeOutput {
                data: BlockWriter::new(data_path.as_ref(), block_size)?,
                ids: BlockWriter::new(id_path.as_ref(), block_size)?,
                scratch,
                scratch_path,
                scratch_blocks: Vec::new(),
            }),
        })
    }

    /// Add a processed block to the merge queue. May be called from
    /// multiple threads; blocks while the queue is full, and turns the
    /// caller into the merge thread when it delivers the k-th block.
    pub fn add(&self, block: InputBlock) -> Result<()> {
        let blocks = {
            let mut st = self.state.lock();
            while st.queue.len() == self.k {
                self.full_cond.wait(&mut st);
            }
            assert!(st.remaining > 0, "more blocks added than announced");
            st.remaining -= 1;
            st.queue.push(block);
            if st.queue.len() < self.k && st.remaining != 0 {
                return Ok(());
            }
            // Got the last input block, or k blocks are available; become
            // the merge thread once any in-progress merge completes.
            while st.merging {
                self.merge_cond.wait(&mut st);
            }
            st.merging = true;
            let blocks = mem::take(&mut st.queue);
            self.full_cond.notify_all();
            blocks
        };
        let result = self.merge_blocks(&blocks);
        let mut st = self.state.lock();
        st.merging = false;
        self.merge_cond.notify_one();
        result
    }

    fn merge_blocks(&self, blocks: &[InputBlock]) -> Result<()> {
        let mut out = self.output.lock();
        let scratch_start = out.scratch.as_ref().map(|w| w.tell());
        let mut cursors = vec![0usize; blocks.len()];
        let mut heap: BinaryHeap<Reverse<(u32, i64, usize)>> =
            BinaryHeap::with_capacity(blocks.len());
        for (i, b) in blocks.iter().enumerate() {
            if let Some(r) = b.records().first() {
                heap.push(Reverse((r.info.htm_id, r.info.id, i)));
            }
        }
        while let Some(Reverse((_, _, i))) = heap.pop() {
            let block = &blocks[i];
            let rec = block.records()[cursors[i]];
            cursors[i] += 1;
            let line = &block.data()[rec.offset..rec.offset + rec.info.length as usize];
            match out.scratch.as_mut() {
                None => {
                    out.data.append(line)?;
                    out.ids.append(&rec.info.id.to_le_bytes())?;
                }
                Some(scratch) => {
                    scratch.append(&rec.info.to_bytes())?;
                    scratch.append(line)?;
                }
            }
            if cursors[i] < block.records().len() {
                let next = block.records()[cursors[i]];
                heap.push(Reverse((next.info.htm_id, next.info.id, i)));
            }
        }
        if let Some(beg) = scratch_start {
            let end = out.scratch.as_ref().map(|w| w.tell()).unwrap_or(beg);
            out.scratch_blocks.push((beg, end));
        }
        Ok(())
    }

    /// Merge any spilled runs and close the output files.
    pub fn finish(self) -> Result<()> {
        {
            let st = self.state.lock();
            assert!(
                st.remaining == 0 && st.queue.is_empty() && !st.merging,
                "finish() called with unmerged input blocks"
            );
        }
        let mut out = self.output.into_inner();
        if let Some(mut scratch) = out.scratch.take() {
            scratch.close()?;
            let mapped = MappedInputFile::open(&out.scratch_path)?;
            let mut runs: Vec<ScratchRun> = out
                .scratch_blocks
                .iter()
                .filter(|(b, e)| e > b)
                .map(|&(b, e)| ScratchRun::new(&mapped, b as usize, e as usize))
                .collect();
            let mut heap: BinaryHeap<Reverse<(u32, i64, usize)>> = BinaryHeap::new();
            for (i, r) in runs.iter().enumerate() {
                heap.push(Reverse((r.info.htm_id, r.info.id, i)));
            }
            while let Some(Reverse((_, _, i))) = heap.pop() {
                let run = &mut runs[i];
                let info = run.info;
                out.data.append(run.line(&mapped))?;
                out.ids.append(&info.id.to_le_bytes())?;
                if run.advance(&mapped) {
                    heap.push(Reverse((run.info.htm_id, run.info.id, i)));
                }
            }
        }
        out.data.close()?;
        out.ids.close()?;
        Ok(())
    }
}

/// A sorted scratch-file run. Record headers precede each line; page
/// residency slides forward in MERGE_WINDOW steps as the run is consumed.
struct ScratchRun {
    pos: usize,
    end: usize,
    window: usize,
    info: RecordInfo,
}

impl ScratchRun {
    fn new(mapped: &MappedInputFile, beg: usize, end: usize) -> Self {
        let window = (beg & !(MERGE_WINDOW - 1)) + MERGE_WINDOW;
        mapped.will_need(beg, (window + MERGE_WINDOW).min(end) - beg);
        let info = RecordInfo::decode(&mapped.data()[beg..beg + RECORD_INFO_SIZE]);
        ScratchRun {
            pos: beg,
            end,
            window,
            info,
        }
    }

    fn line<'a>(&self, mapped: &'a MappedInputFile) -> &'a [u8] {
        let beg = self.pos + RECORD_INFO_SIZE;
        &mapped.data()[beg..beg + self.info.length as usize]
    }

    /// Step to the next record; false when the run is exhausted.
    fn advance(&mut self, mapped: &MappedInputFile) -> bool {
        let next = self.pos + RECORD_INFO_SIZE + self.info.length as usize;
        if next >= self.end {
            return false;
        }
        if next >= self.window {
            mapped.dont_need(self.window - MERGE_WINDOW, MERGE_WINDOW);
            self.window += MERGE_WINDOW;
            if self.window + MERGE_WINDOW < self.end {
                mapped.will_need(self.window + MERGE_WINDOW, MERGE_WINDOW);
            }
        }
        self.pos = next;
        self.info = RecordInfo::decode(&mapped.data()[next..next + RECORD_INFO_SIZE]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_factor_must_be_at_least_two() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = Merger::new(
            dir.path().join("data.csv"),
            dir.path().join("ids.bin"),
            dir.path().join("scratch.bin"),
            1024,
            1,
            4,
        );
        assert!(result.is_err());
        assert!(
            Merger::new(
                dir.path().join("d"),
                dir.path().join("i"),
                dir.path().join("s"),
                1024,
                2,
                0
            )
            .is_err()
        );
    }
}
