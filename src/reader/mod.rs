//! # Directory Reader
//!
//! Multi-epoch point lookups over a finished directory partition.
//!
//! [`DirReader::open`] parses the fixed footer at the end of the index
//! log, verifies its magic, and loads the root block — the map from
//! epoch id to that epoch's meta-index block. [`DirReader::read_all`]
//! then resolves a key across every epoch:
//!
//! ```text
//! footer → root → meta-index → table (filter gate) → index → data block
//! ```
//!
//! Every value ever stored under the key is appended to the result in
//! `(epoch ascending, within-epoch insertion)` order, with no
//! separator. A key that was never written is not an error: the result
//! is empty and the status is `Ok`.
//!
//! With a `reader_pool` configured, each epoch's resolution is
//! dispatched to the pool and merged in epoch order; the first failure
//! in ascending epoch order wins.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use thiserror::Error;
use tracing::{debug, trace};

use crate::block::{unseal_block, Block, BlockError};
use crate::filter::{filter_may_match, FilterError};
use crate::format::{BlockHandle, ChunkType, Footer, FormatError, TableHandle, FOOTER_LEN};
use crate::log::LogSource;
use crate::options::DirOptions;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised on the read path of a directory partition.
#[derive(Debug, Error)]
pub enum ReadError {
    /// A log file (or the bound data source) is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Structural damage: bad magic, bad trailer, handle out of bounds.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Block-level decode or checksum failure.
    #[error("corruption: {0}")]
    Block(#[from] BlockError),

    /// Wire-format decode failure.
    #[error("corruption: {0}")]
    Format(#[from] FormatError),

    /// Unknown filter encoding under `paranoid_checks`.
    #[error(transparent)]
    Filter(#[from] FilterError),
}

// ------------------------------------------------------------------------------------------------
// Read accounting
// ------------------------------------------------------------------------------------------------

/// Read accounting for one reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadStats {
    /// Bytes fetched from the data log.
    pub data_bytes: u64,

    /// Fetches issued against the data log.
    pub data_ops: u64,

    /// Bytes fetched from the index log.
    pub index_bytes: u64,

    /// Fetches issued against the index log.
    pub index_ops: u64,
}

#[derive(Default)]
struct StatCounters {
    data_bytes: AtomicU64,
    data_ops: AtomicU64,
    index_bytes: AtomicU64,
    index_ops: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// DirReader
// ------------------------------------------------------------------------------------------------

struct ReaderInner {
    options: DirOptions,
    indx: Arc<dyn LogSource>,
    /// Rebindable: a rotated directory is read through a merged data
    /// artifact bound after open.
    data: RwLock<Option<Arc<dyn LogSource>>>,
    /// Root entries in epoch order.
    epochs: Vec<BlockHandle>,
    footer: Footer,
    stats: StatCounters,
}

/// Reads directory contents from a pair of indexed log files.
///
/// Cheap to clone; all clones share the same sources and accounting.
#[derive(Clone)]
pub struct DirReader {
    inner: Arc<ReaderInner>,
}

impl DirReader {
    /// Opens the directory partition rooted at `dir` for reading.
    ///
    /// Reads and validates the footer, then loads the root block. The
    /// data log is bound from `<rank>.dat` (or the first rotated
    /// segment) when present; rotated directories can be rebound later
    /// via [`DirReader::rebind_data_source`].
    pub fn open(options: DirOptions, dir: impl AsRef<Path>) -> Result<DirReader, ReadError> {
        let dir = dir.as_ref();
        let indx_path = dir.join(format!("{}.idx", options.rank));
        let indx = options.fs.open(&indx_path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ReadError::NotFound(indx_path.display().to_string())
            } else {
                ReadError::Io(e)
            }
        })?;

        let len = indx.len();
        if (len as usize) < FOOTER_LEN {
            return Err(ReadError::Corruption(
                "index log shorter than the footer".into(),
            ));
        }
        let footer_bytes = indx.read_at(len - FOOTER_LEN as u64, FOOTER_LEN)?;
        let footer = Footer::decode(&footer_bytes)
            .map_err(|e| ReadError::Corruption(e.to_string()))?;

        let stats = StatCounters::default();
        let root = fetch_block(
            indx.as_ref(),
            footer.root_handle,
            options.verify_checksums,
            &stats.index_bytes,
            &stats.index_ops,
        )?;
        let mut epochs = Vec::new();
        for entry in root.iter() {
            let (_, value) = entry?;
            let (handle, _) = BlockHandle::decode_from(&value)?;
            epochs.push(handle);
        }

        // Bind the data log when it exists under a conventional name;
        // rotated directories are rebound explicitly.
        let data = [
            dir.join(format!("{}.dat", options.rank)),
            dir.join(format!("{}.dat.0", options.rank)),
        ]
        .iter()
        .find_map(|path| options.fs.open(path).ok());

        debug!(
            num_epochs = epochs.len(),
            dir = %dir.display(),
            "directory reader opened"
        );
        Ok(DirReader {
            inner: Arc::new(ReaderInner {
                options,
                indx,
                data: RwLock::new(data),
                epochs,
                footer,
                stats,
            }),
        })
    }

    /// Number of epochs recorded in the root block.
    pub fn num_epochs(&self) -> u32 {
        self.inner.epochs.len() as u32
    }

    /// Mode and filter bytes the directory was finished with.
    pub fn footer(&self) -> Footer {
        self.inner.footer
    }

    /// Points the reader's data fetches at a different artifact, e.g. a
    /// merged file assembled from rotated epoch logs.
    pub fn rebind_data_source(&self, source: Arc<dyn LogSource>) {
        let mut guard = self
            .inner
            .data
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(source);
    }

    /// Read accounting since open.
    pub fn read_stats(&self) -> ReadStats {
        let s = &self.inner.stats;
        ReadStats {
            data_bytes: s.data_bytes.load(Ordering::Relaxed),
            data_ops: s.data_ops.load(Ordering::Relaxed),
            index_bytes: s.index_bytes.load(Ordering::Relaxed),
            index_ops: s.index_ops.load(Ordering::Relaxed),
        }
    }

    /// Returns the concatenation of every value ever stored under
    /// `key`, across all epochs.
    pub fn read_all(&self, key: &[u8]) -> Result<Vec<u8>, ReadError> {
        let num_epochs = self.inner.epochs.len();
        if num_epochs == 0 {
            return Ok(Vec::new());
        }

        match &self.inner.options.reader_pool {
            Some(pool) if num_epochs > 1 => {
                self.read_all_parallel(key, Arc::clone(pool))
            }
            _ => {
                let mut dst = Vec::new();
                for epoch in 0..num_epochs {
                    let mut chunk = self.inner.read_epoch(key, epoch)?;
                    dst.append(&mut chunk);
                }
                Ok(dst)
            }
        }
    }

    /// Fans one lookup out across the reader pool, one job per epoch,
    /// and merges per-epoch buffers in epoch order.
    fn read_all_parallel(
        &self,
        key: &[u8],
        pool: Arc<dyn crate::pool::ThreadPool>,
    ) -> Result<Vec<u8>, ReadError> {
        let num_epochs = self.inner.epochs.len();

        struct GetContext {
            results: Mutex<(Vec<Option<Result<Vec<u8>, ReadError>>>, usize)>,
            cv: Condvar,
        }
        let ctx = Arc::new(GetContext {
            results: Mutex::new((
                (0..num_epochs).map(|_| None).collect::<Vec<_>>(),
                num_epochs,
            )),
            cv: Condvar::new(),
        });

        for epoch in 0..num_epochs {
            let inner = Arc::clone(&self.inner);
            let ctx = Arc::clone(&ctx);
            let key = key.to_vec();
            pool.execute(Box::new(move || {
                let result = inner.read_epoch(&key, epoch);
                let mut guard = ctx
                    .results
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.0[epoch] = Some(result);
                guard.1 -= 1;
                if guard.1 == 0 {
                    ctx.cv.notify_all();
                }
            }));
        }

        let mut guard = ctx
            .results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while guard.1 != 0 {
            guard = ctx
                .cv
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        // Merge in epoch order; the first failing epoch wins.
        let mut dst = Vec::new();
        for slot in guard.0.iter_mut() {
            let mut chunk = slot.take().expect("epoch fetch unaccounted")?;
            dst.append(&mut chunk);
        }
        Ok(dst)
    }
}

impl ReaderInner {
    /// Collects every value stored under `key` within one epoch, in
    /// insertion order.
    fn read_epoch(&self, key: &[u8], epoch: usize) -> Result<Vec<u8>, ReadError> {
        let meta = fetch_block(
            self.indx.as_ref(),
            self.epochs[epoch],
            self.options.verify_checksums,
            &self.stats.index_bytes,
            &self.stats.index_ops,
        )?;

        let mut dst = Vec::new();
        // Tables are stored in creation order and their ranges may
        // overlap, so the meta-index is scanned linearly.
        for entry in meta.iter() {
            let (_, value) = entry?;
            let table = TableHandle::decode(&value)?;
            if key < table.smallest_key.as_slice() || key > table.largest_key.as_slice() {
                continue;
            }
            if !self.table_may_contain(key, &table)? {
                trace!(epoch, "filter skipped table");
                continue;
            }
            self.fetch_from_table(key, &table, &mut dst)?;
        }
        Ok(dst)
    }

    /// Consults the table's filter block, if any.
    fn table_may_contain(&self, key: &[u8], table: &TableHandle) -> Result<bool, ReadError> {
        if table.filter_handle.is_null() {
            return Ok(true);
        }
        let sealed = read_handle(
            self.indx.as_ref(),
            table.filter_handle,
            &self.stats.index_bytes,
            &self.stats.index_ops,
        )?;
        let (payload, tag) = unseal_block(&sealed, self.options.verify_checksums)?;
        Ok(filter_may_match(
            key,
            &payload,
            tag,
            self.options.paranoid_checks,
        )?)
    }

    /// Scans the table's data blocks for exact matches, appending
    /// values to `dst` until a key greater than the target is seen.
    fn fetch_from_table(
        &self,
        key: &[u8],
        table: &TableHandle,
        dst: &mut Vec<u8>,
    ) -> Result<(), ReadError> {
        let index = fetch_block(
            self.indx.as_ref(),
            table.index_handle,
            self.options.verify_checksums,
            &self.stats.index_bytes,
            &self.stats.index_ops,
        )?;

        let data_source = {
            let guard = self
                .data
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard
                .clone()
                .ok_or_else(|| ReadError::NotFound("no data source bound".into()))?
        };

        let mut iter = index.iter();
        iter.seek(key)?;
        let mut exhausted = false;
        for entry in iter {
            if exhausted {
                break;
            }
            let (_, value) = entry?;
            let (handle, _) = BlockHandle::decode_from(&value)?;
            let block = fetch_block(
                data_source.as_ref(),
                handle,
                self.options.verify_checksums,
                &self.stats.data_bytes,
                &self.stats.data_ops,
            )?;

            let mut entries = block.iter();
            entries.seek(key)?;
            for entry in entries {
                let (k, v) = entry?;
                if k == key {
                    dst.extend_from_slice(&v);
                } else {
                    // Keys are sorted; anything larger ends the search.
                    exhausted = true;
                    break;
                }
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Block fetch helpers
// ------------------------------------------------------------------------------------------------

fn read_handle(
    source: &dyn LogSource,
    handle: BlockHandle,
    bytes: &AtomicU64,
    ops: &AtomicU64,
) -> Result<Vec<u8>, ReadError> {
    let data = source
        .read_at(handle.offset, handle.size as usize)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ReadError::Corruption("block handle out of bounds".into())
            } else {
                ReadError::Io(e)
            }
        })?;
    bytes.fetch_add(handle.size, Ordering::Relaxed);
    ops.fetch_add(1, Ordering::Relaxed);
    Ok(data)
}

/// Fetches, unseals and parses one data/index/meta/root block.
fn fetch_block(
    source: &dyn LogSource,
    handle: BlockHandle,
    verify_checksums: bool,
    bytes: &AtomicU64,
    ops: &AtomicU64,
) -> Result<Block, ReadError> {
    let sealed = read_handle(source, handle, bytes, ops)?;
    let (payload, tag) = unseal_block(&sealed, verify_checksums)?;
    match ChunkType::from_u8(tag) {
        Some(ChunkType::Raw) | Some(ChunkType::Snappy) => {}
        _ => {
            return Err(ReadError::Corruption(format!(
                "unexpected chunk type {tag} for a table block"
            )));
        }
    }
    Ok(Block::new(payload)?)
}
