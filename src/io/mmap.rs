use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::{Advice, Mmap, MmapOptions, UncheckedAdvice};

use crate::core::error::Result;

const PAGE_SIZE: usize = 4096;

/// A read-only memory-mapped input file.
///
/// Page residency is managed explicitly: callers advise the kernel before
/// streaming through a byte range and release it afterwards, so that large
/// scans do not evict the rest of the page cache.
pub struct MappedInputFile {
    mmap: Option<Mmap>,
    path: PathBuf,
}

impl MappedInputFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        let mmap = if len == 0 {
            None
        } else {
            Some(unsafe { MmapOptions::new().map(&file)? })
        };
        Ok(MappedInputFile { mmap, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &[u8] {
        self.mmap.as_ref().map_or(&[], |m| &m[..])
    }

    /// Ask the kernel to prefetch the pages covering the given range.
    pub fn will_need(&self, offset: usize, len: usize) {
        if let Some((mmap, beg, len)) = self.page_range(offset, len) {
            // advice is an optimization; failures are ignored
            let _ = mmap.advise_range(Advice::WillNeed, beg, len);
        }
    }

    /// Tell the kernel the pages covering the given range will not be
    /// touched again soon.
    pub fn dont_need(&self, offset: usize, len: usize) {
        if let Some((mmap, beg, len)) = self.page_range(offset, len) {
            // read-only file-backed mapping: dropping residency is harmless
            let _ = unsafe { mmap.unchecked_advise_range(UncheckedAdvice::DontNeed, beg, len) };
        }
    }

    fn page_range(&self, offset: usize, len: usize) -> Option<(&Mmap, usize, usize)> {
        let mmap = self.mmap.as_ref()?;
        if len == 0 || offset >= mmap.len() {
            return None;
        }
        let beg = offset & !(PAGE_SIZE - 1);
        let end = (offset + len).min(mmap.len());
        let end = (end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = end.min((mmap.len() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1));
        Some((mmap, beg, end - beg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"hello world").unwrap();
        let m = MappedInputFile::open(&path).unwrap();
        assert_eq!(m.len(), 11);
        assert_eq!(&m.data()[..5], b"hello");
        m.will_need(0, 11);
        m.dont_need(0, 11);
    }

    #[test]
    fn test_empty_file_maps_to_empty_slice() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        let m = MappedInputFile::open(&path).unwrap();
        assert!(m.is_empty());
        assert_eq!(m.data(), b"");
    }
}
