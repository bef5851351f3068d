use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::core::error::Result;

/// A read-only input file supporting positioned reads from any thread.
pub struct InputFile {
    file: File,
    path: PathBuf,
    size: u64,
}

impl InputFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(InputFile { file, path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Fill `buf` from the given offset.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// An append-only output file.
pub struct OutputFile {
    file: File,
    path: PathBuf,
}

impl OutputFile {
    /// Create the file, truncating any previous content.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(OutputFile { file, path })
    }

    /// Open the file for appending, creating it if needed.
    pub fn append_to(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(OutputFile { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positioned_reads() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"0123456789").unwrap();
        let f = InputFile::open(&path).unwrap();
        assert_eq!(f.size(), 10);
        let mut buf = [0u8; 4];
        f.read_at(&mut buf, 3).unwrap();
        assert_eq!(&buf, b"3456");
    }

    #[test]
    fn test_append_mode_concatenates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out");
        {
            let mut f = OutputFile::create(&path).unwrap();
            f.append(b"ab").unwrap();
        }
        {
            let mut f = OutputFile::append_to(&path).unwrap();
            f.append(b"cd").unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }
}
