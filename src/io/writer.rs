use std::fs::File;
use std::io::Write;
use std::mem;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Sender, bounded};

use crate::core::error::{Error, ErrorKind, Result};

/// Asynchronous block writer.
///
/// Data is appended to an in-memory block; full blocks are handed to a
/// dedicated writer thread over a bounded channel of owned buffers, so the
/// producer keeps filling one block while the previous one is written to
/// disk. Capacity 2 reproduces double-buffered back-pressure: appending
/// blocks once two blocks are queued behind the writer.
///
/// A block writer must be used by a single producer thread at a time.
pub struct BlockWriter {
    path: PathBuf,
    block_size: usize,
    buf: Vec<u8>,
    tx: Option<Sender<Vec<u8>>>,
    handle: Option<JoinHandle<Result<()>>>,
    off: u64,
    closed: bool,
}

impl BlockWriter {
    pub fn new(path: impl Into<PathBuf>, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::new(
                ErrorKind::Config,
                "zero is not a legal block size".to_string(),
            ));
        }
        let path = path.into();
        let mut file = File::create(&path)?;
        let (tx, rx) = bounded::<Vec<u8>>(2);
        let handle = thread::spawn(move || -> Result<()> {
            for block in rx {
                file.write_all(&block)?;
            }
            Ok(())
        });
        Ok(BlockWriter {
            path,
            block_size,
            buf: Vec::with_capacity(block_size),
            tx: Some(tx),
            handle: Some(handle),
            off: 0,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of bytes appended so far.
    pub fn tell(&self) -> u64 {
        self.off
    }

    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "block writer has already been closed".to_string(),
            ));
        }
        self.off += data.len() as u64;
        while !data.is_empty() {
            let n = (self.block_size - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.buf.len() == self.block_size {
                self.issue()?;
            }
        }
        Ok(())
    }

    fn issue(&mut self) -> Result<()> {
        let block = mem::replace(&mut self.buf, Vec::with_capacity(self.block_size));
        let tx = self.tx.as_ref().expect("writer thread already joined");
        if tx.send(block).is_err() {
            // The writer thread is gone; join it to surface its error.
            return Err(self.join_writer());
        }
        Ok(())
    }

    /// Flush remaining data and join the writer thread. Any further
    /// append is an error.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let tail = mem::take(&mut self.buf);
        if let Some(tx) = self.tx.take() {
            if !tail.is_empty() && tx.send(tail).is_err() {
                return Err(self.join_writer());
            }
            drop(tx);
        }
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(Error::new(ErrorKind::Io, "writer thread panicked".to_string()))),
            None => Ok(()),
        }
    }

    fn join_writer(&mut self) -> Error {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(Ok(())) => Error::new(ErrorKind::Io, "writer thread exited early".to_string()),
                Ok(Err(e)) => e,
                Err(_) => Error::new(ErrorKind::Io, "writer thread panicked".to_string()),
            },
            None => Error::new(ErrorKind::Io, "writer thread exited early".to_string()),
        }
    }
}

impl Drop for BlockWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
