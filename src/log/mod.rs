//! # Log Sink / Source
//!
//! Byte-level I/O for the two logs backing a directory partition: the
//! **data log** (`<rank>.dat`, sequence of sealed data blocks) and the
//! **index log** (`<rank>.idx`, filter/index/meta-index/root blocks and
//! the fixed footer).
//!
//! [`LogSink`] is the buffered, append-only write side: bytes accumulate
//! in memory and reach the file once the buffered size crosses the
//! configured watermark (or on an explicit flush/sync). Handles into a
//! log are expressed in *logical* offsets — buffered but unflushed bytes
//! already own their final position.
//!
//! [`LogSource`] is the random-access read side; disk-backed sources are
//! memory-mapped and immutable after open, and are shared via `Arc`
//! between the reader and its block-fetch helpers.
//!
//! The filesystem itself is injected through the [`Fs`] trait:
//! [`DiskFs`] is the real thing, [`MemFs`] keeps whole logs in memory
//! for tests and benchmarks.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by log sinks and sources.
#[derive(Debug, Error)]
pub enum LogError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Filesystem abstraction
// ------------------------------------------------------------------------------------------------

/// Append-only write handle for one log file.
pub trait WritableLog: Write + Send {
    /// Forces written bytes down to durable storage.
    fn sync(&mut self) -> io::Result<()>;
}

/// Random-access read handle for one log file. Immutable after open.
pub trait LogSource: Send + Sync + std::fmt::Debug {
    /// Reads exactly `len` bytes starting at `offset`.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Total size of the log in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Filesystem the directory's logs live on. Injected so tests and
/// benchmarks can run against memory instead of disk.
pub trait Fs: Send + Sync {
    /// Ensures a directory (and its parents) exists.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Creates (or truncates) a writable log file.
    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableLog>>;

    /// Opens an existing log file for random-access reads.
    fn open(&self, path: &Path) -> io::Result<Arc<dyn LogSource>>;

    /// Size of an existing log file.
    fn file_size(&self, path: &Path) -> io::Result<u64>;
}

// ------------------------------------------------------------------------------------------------
// Disk filesystem
// ------------------------------------------------------------------------------------------------

/// The real filesystem: `std::fs` writes, memory-mapped reads.
pub struct DiskFs;

struct DiskLog {
    file: File,
}

impl Write for DiskLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl WritableLog for DiskLog {
    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[derive(Debug)]
struct MmapSource {
    map: Mmap,
}

impl LogSource for MmapSource {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        if end > self.map.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(self.map[start..end].to_vec())
    }

    fn len(&self) -> u64 {
        self.map.len() as u64
    }
}

impl Fs for DiskFs {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableLog>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        debug!(path = %path.display(), "created log file");
        Ok(Box::new(DiskLog { file }))
    }

    fn open(&self, path: &Path) -> io::Result<Arc<dyn LogSource>> {
        let file = File::open(path)?;
        // Read-only map over a file that is never written again.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Arc::new(MmapSource { map }))
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }
}

// ------------------------------------------------------------------------------------------------
// In-memory filesystem
// ------------------------------------------------------------------------------------------------

/// A filesystem of byte vectors. Every created file lives in a shared
/// map; sources observe the bytes present at read time.
#[derive(Default)]
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemLog {
    data: Arc<Mutex<Vec<u8>>>,
}

impl Write for MemLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data
            .lock()
            .map_err(|_| io::Error::other("file lock poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WritableLog for MemLog {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct MemSource {
    data: Arc<Mutex<Vec<u8>>>,
}

impl LogSource for MemSource {
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let data = self
            .data
            .lock()
            .map_err(|_| io::Error::other("file lock poisoned"))?;
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        if end > data.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
        }
        Ok(data[start..end].to_vec())
    }

    fn len(&self) -> u64 {
        self.data.lock().map(|data| data.len() as u64).unwrap_or(0)
    }
}

impl Fs for MemFs {
    fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn WritableLog>> {
        let data = Arc::new(Mutex::new(Vec::new()));
        self.files
            .lock()
            .map_err(|_| io::Error::other("fs lock poisoned"))?
            .insert(path.to_path_buf(), Arc::clone(&data));
        Ok(Box::new(MemLog { data }))
    }

    fn open(&self, path: &Path) -> io::Result<Arc<dyn LogSource>> {
        let files = self
            .files
            .lock()
            .map_err(|_| io::Error::other("fs lock poisoned"))?;
        let data = files
            .get(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        Ok(Arc::new(MemSource {
            data: Arc::clone(data),
        }))
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        let files = self
            .files
            .lock()
            .map_err(|_| io::Error::other("fs lock poisoned"))?;
        let data = files
            .get(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let len = data
            .lock()
            .map_err(|_| io::Error::other("file lock poisoned"))?
            .len();
        Ok(len as u64)
    }
}

// ------------------------------------------------------------------------------------------------
// IoStats
// ------------------------------------------------------------------------------------------------

/// Write accounting for one sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Bytes handed to the underlying file.
    pub bytes: u64,

    /// Write calls issued to the underlying file.
    pub ops: u64,
}

// ------------------------------------------------------------------------------------------------
// LogSink
// ------------------------------------------------------------------------------------------------

/// Buffered append-only writer for one log.
///
/// Single-producer: exactly one component owns a sink at a time (the
/// compactor owns the data sink for the duration of its run).
pub struct LogSink {
    file: Box<dyn WritableLog>,
    buf: Vec<u8>,
    min_flush: usize,
    flushed: u64,
    stats: IoStats,
}

impl LogSink {
    /// Wraps a writable log. `min_flush` is the buffered-byte watermark
    /// that triggers a write to the file; `buffer_capacity` pre-sizes
    /// the in-memory buffer.
    pub fn new(file: Box<dyn WritableLog>, min_flush: usize, buffer_capacity: usize) -> Self {
        Self {
            file,
            buf: Vec::with_capacity(buffer_capacity),
            min_flush,
            flushed: 0,
            stats: IoStats::default(),
        }
    }

    /// Logical end offset of the log: flushed bytes plus buffered bytes.
    pub fn offset(&self) -> u64 {
        self.flushed + self.buf.len() as u64
    }

    /// Appends bytes, returning the logical offset at which they start.
    pub fn append(&mut self, data: &[u8]) -> Result<u64, LogError> {
        let at = self.offset();
        self.buf.extend_from_slice(data);
        if self.buf.len() >= self.min_flush {
            self.flush_buffered()?;
        }
        trace!(at, len = data.len(), "sink append");
        Ok(at)
    }

    /// Writes all buffered bytes to the file.
    pub fn flush_buffered(&mut self) -> Result<(), LogError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.file.write_all(&self.buf)?;
        self.flushed += self.buf.len() as u64;
        self.stats.bytes += self.buf.len() as u64;
        self.stats.ops += 1;
        self.buf.clear();
        Ok(())
    }

    /// Flushes and forces bytes to durable storage.
    pub fn sync(&mut self) -> Result<(), LogError> {
        self.flush_buffered()?;
        self.file.sync()?;
        Ok(())
    }

    /// Swaps in a fresh log file, closing out the current one. Logical
    /// offsets keep running across the rotation, so concatenating the
    /// rotated files in order reproduces one addressable log.
    pub fn rotate(&mut self, file: Box<dyn WritableLog>) -> Result<(), LogError> {
        self.sync()?;
        self.file = file;
        debug!(offset = self.flushed, "rotated log sink");
        Ok(())
    }

    /// Write accounting since the sink was created.
    pub fn io_stats(&self) -> IoStats {
        self.stats
    }
}
