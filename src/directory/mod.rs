//! # Directory Logger (write coordinator)
//!
//! The write path of one directory partition:
//!
//! 1. [`WriteBuffer`] — an append-only in-memory store that keeps
//!    arrival order and sorts once, when it is about to be compacted.
//! 2. [`DirLogger`] — the double-buffered memtable: entries land in the
//!    active buffer; when it fills it swaps into the immutable slot and
//!    a background compaction drains it through the [`TableLogger`]
//!    into sorted, filtered, indexed tables.
//! 3. [`DirWriter`] — the public facade that opens the partition's log
//!    files (`<rank>.dat`, `<rank>.idx`) and exposes `add` /
//!    `epoch_flush` / `flush` / `finish`.
//!
//! ## Immutable-slot state machine
//!
//! ```text
//! Empty ──swap──► Pending(normal|epoch|final) ──worker──► Compacting ──► Empty
//! ```
//!
//! All transitions happen under the partition mutex; one condition
//! variable signals both "slot drained" (unblocking writers) and
//! "flush completed" (unblocking `flush(wait)`). At most one compaction
//! is outstanding per partition.
//!
//! ## Failure latching
//!
//! The first compaction error is latched; subsequent `add`/`flush`
//! calls return the captured status and `finish` surfaces it.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::filter::{FilterBuilder, FilterError};
use crate::format::{decode_varint64, encode_varint64};
use crate::log::{IoStats, LogError, LogSink};
use crate::options::{DirMode, DirOptions};
use crate::table::{OutputStats, TableError, TableLogger};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised on the write path of a directory partition.
#[derive(Debug, Error)]
pub enum DirError {
    /// Failure while logging tables.
    #[error(transparent)]
    Table(#[from] TableError),

    /// Sink-level failure.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Filter configuration failure.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Contract violation (duplicate key in unique mode, write after
    /// finish, unsorted input under `skip_sort`).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A non-blocking write could not make progress.
    #[error("write buffer busy")]
    Busy,

    /// A previous operation failed; the partition refuses new writes.
    #[error("directory already failed: {0}")]
    Latched(String),
}

// ------------------------------------------------------------------------------------------------
// WriteBuffer
// ------------------------------------------------------------------------------------------------

/// Append-only in-memory key/value store.
///
/// Entries are encoded back to back in one byte buffer with a side
/// array of starting offsets. Sorting happens exactly once, on
/// [`WriteBuffer::finish_and_sort`], with a stable sort so duplicate
/// keys keep their arrival order.
pub struct WriteBuffer {
    buffer: Vec<u8>,
    offsets: Vec<u32>,
    finished: bool,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            offsets: Vec::new(),
            finished: false,
        }
    }

    /// Pre-sizes the buffer for the expected load.
    pub fn reserve(&mut self, num_entries: usize, bytes: usize) {
        self.offsets.reserve(num_entries);
        self.buffer.reserve(bytes);
    }

    pub fn num_entries(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Bytes of encoded entries currently stored.
    pub fn current_size(&self) -> usize {
        self.buffer.len()
    }

    /// Real memory footprint, capacity included.
    pub fn memory_usage(&self) -> usize {
        self.buffer.capacity() + self.offsets.capacity() * std::mem::size_of::<u32>()
    }

    /// Appends an entry.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(!self.finished);
        self.offsets.push(self.buffer.len() as u32);
        encode_varint64(&mut self.buffer, key.len() as u64);
        encode_varint64(&mut self.buffer, value.len() as u64);
        self.buffer.extend_from_slice(key);
        self.buffer.extend_from_slice(value);
    }

    fn entry_at_offset(&self, offset: usize) -> (&[u8], &[u8]) {
        let buf = &self.buffer[offset..];
        let (key_len, n0) = decode_varint64(buf).expect("write buffer entry header");
        let (value_len, n1) = decode_varint64(&buf[n0..]).expect("write buffer entry header");
        let key_start = n0 + n1;
        let value_start = key_start + key_len as usize;
        (
            &buf[key_start..value_start],
            &buf[value_start..value_start + value_len as usize],
        )
    }

    /// Entry at position `i` of the (sorted, once finished) order.
    pub fn entry(&self, i: usize) -> (&[u8], &[u8]) {
        self.entry_at_offset(self.offsets[i] as usize)
    }

    /// Sorts the entry index by key.
    ///
    /// With `skip_sort` the input is trusted to be pre-sorted and only
    /// checked in debug builds. The sort is stable: entries with equal
    /// keys keep their insertion order.
    pub fn finish_and_sort(&mut self, skip_sort: bool) {
        debug_assert!(!self.finished);
        self.finished = true;
        if skip_sort {
            debug_assert!(
                self.offsets
                    .windows(2)
                    .all(|pair| self.entry_at_offset(pair[0] as usize).0
                        <= self.entry_at_offset(pair[1] as usize).0),
                "skip_sort requires pre-sorted keys"
            );
            return;
        }
        let buffer = std::mem::take(&mut self.buffer);
        self.offsets
            .sort_by(|&a, &b| entry_key(&buffer, a).cmp(entry_key(&buffer, b)));
        self.buffer = buffer;
    }

    /// Clears the buffer for reuse, keeping its allocations.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.offsets.clear();
        self.finished = false;
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_key(buffer: &[u8], offset: u32) -> &[u8] {
    let buf = &buffer[offset as usize..];
    let (key_len, n0) = decode_varint64(buf).expect("write buffer entry header");
    let (_, n1) = decode_varint64(&buf[n0..]).expect("write buffer entry header");
    &buf[n0 + n1..n0 + n1 + key_len as usize]
}

// ------------------------------------------------------------------------------------------------
// Flush options
// ------------------------------------------------------------------------------------------------

/// Controls for [`DirLogger::flush`].
#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    /// Return once the compaction is scheduled instead of waiting for
    /// it to complete.
    pub no_wait: bool,

    /// Seal the current epoch after draining.
    pub epoch_flush: bool,

    /// Finalize the directory after draining (writes the footer).
    pub finalize: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            no_wait: true,
            epoch_flush: false,
            finalize: false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// DirLogger
// ------------------------------------------------------------------------------------------------

enum ImmSlot {
    Empty,
    Pending {
        buf: WriteBuffer,
        epoch_flush: bool,
        finalize: bool,
    },
    Compacting,
}

struct LoggerCore {
    mem: WriteBuffer,
    spare: Option<WriteBuffer>,
    imm: ImmSlot,

    /// Taken by the compaction worker for the duration of its run.
    table: Option<TableLogger>,

    /// Filter builder cached across compactions (also taken by the
    /// worker); `None` when filters are disabled.
    filter: Option<FilterBuilder>,

    num_flush_requested: u64,
    num_flush_completed: u64,
    has_bg_compaction: bool,
    finished: bool,

    num_dropped_keys: u64,
    latched: Option<String>,
}

struct LoggerShared {
    core: Mutex<LoggerCore>,
    cv: Condvar,
}

/// Sequentially formats incoming entries as multiple sorted runs of
/// indexed tables, compacting in the background. Thread-safe.
pub struct DirLogger {
    options: DirOptions,
    shared: Arc<LoggerShared>,
    dir: PathBuf,
    entries_per_buf: usize,
    bytes_per_buf: usize,
}

impl DirLogger {
    /// Wires a logger onto an existing table logger. `dir` is the
    /// partition directory, used for data-log rotation.
    pub fn new(options: DirOptions, dir: PathBuf, table: TableLogger) -> Result<Self, DirError> {
        let filter = FilterBuilder::from_options(&options)?;
        let has_filter = filter.is_some();

        let bytes_per_buf = options.buffer_budget().max(1);
        let entries_per_buf = options.entries_per_table();

        let mut mem = WriteBuffer::new();
        let mut spare = WriteBuffer::new();
        mem.reserve(entries_per_buf, bytes_per_buf);
        spare.reserve(entries_per_buf, bytes_per_buf);

        info!(
            entries_per_buf,
            bytes_per_buf, has_filter, "directory logger opened"
        );

        Ok(Self {
            shared: Arc::new(LoggerShared {
                core: Mutex::new(LoggerCore {
                    mem,
                    spare: Some(spare),
                    imm: ImmSlot::Empty,
                    table: Some(table),
                    filter,
                    num_flush_requested: 0,
                    num_flush_completed: 0,
                    has_bg_compaction: false,
                    finished: false,
                    num_dropped_keys: 0,
                    latched: None,
                }),
                cv: Condvar::new(),
            }),
            options,
            dir,
            entries_per_buf,
            bytes_per_buf,
        })
    }

    fn lock(&self) -> MutexGuard<'_, LoggerCore> {
        self.shared
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends one entry, possibly triggering (and waiting on) a
    /// buffer swap.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<(), DirError> {
        let mut core = self.lock();
        loop {
            if let Some(message) = &core.latched {
                return Err(DirError::Latched(message.clone()));
            }
            if core.finished {
                return Err(DirError::InvalidArgument(
                    "directory already finished".into(),
                ));
            }

            let entry_bytes = key.len() + value.len() + 8;
            let fits = core.mem.num_entries() < self.entries_per_buf
                && (core.mem.is_empty()
                    || core.mem.current_size() + entry_bytes <= self.bytes_per_buf);
            if fits {
                core.mem.add(key, value);
                return Ok(());
            }

            if !matches!(core.imm, ImmSlot::Empty) {
                if self.options.non_blocking {
                    trace!("write buffer busy, failing fast");
                    return Err(DirError::Busy);
                }
                core = self
                    .shared
                    .cv
                    .wait(core)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                continue;
            }

            core = self.swap_and_schedule(core, false, false);
        }
    }

    /// Serializes the active buffer as the next compaction unit.
    pub fn flush(&self, flush: FlushOptions) -> Result<(), DirError> {
        let mut core = self.lock();
        if let Some(message) = &core.latched {
            return Err(DirError::Latched(message.clone()));
        }
        if core.finished {
            return Err(DirError::InvalidArgument(
                "directory already finished".into(),
            ));
        }

        // Drain any previous compaction unit first.
        while !matches!(core.imm, ImmSlot::Empty) {
            core = self
                .shared
                .cv
                .wait(core)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if let Some(message) = &core.latched {
            return Err(DirError::Latched(message.clone()));
        }

        if core.mem.is_empty() && !flush.epoch_flush && !flush.finalize {
            return Ok(()); // nothing to do
        }

        core = self.swap_and_schedule(core, flush.epoch_flush, flush.finalize);
        let target = core.num_flush_requested;

        if !flush.no_wait {
            while core.num_flush_completed < target && core.latched.is_none() {
                core = self
                    .shared
                    .cv
                    .wait(core)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
        if let Some(message) = &core.latched {
            return Err(DirError::Latched(message.clone()));
        }
        Ok(())
    }

    /// Waits until no compaction is outstanding.
    pub fn wait(&self) -> Result<(), DirError> {
        let mut core = self.lock();
        while !matches!(core.imm, ImmSlot::Empty) || core.has_bg_compaction {
            core = self
                .shared
                .cv
                .wait(core)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if let Some(message) = &core.latched {
            return Err(DirError::Latched(message.clone()));
        }
        Ok(())
    }

    /// Moves the active buffer into the immutable slot and schedules a
    /// compaction for it. Requires the slot to be empty.
    fn swap_and_schedule<'a>(
        &'a self,
        mut core: MutexGuard<'a, LoggerCore>,
        epoch_flush: bool,
        finalize: bool,
    ) -> MutexGuard<'a, LoggerCore> {
        debug_assert!(matches!(core.imm, ImmSlot::Empty));

        let mut fresh = core.spare.take().expect("spare buffer missing");
        fresh.reset();
        let full = std::mem::replace(&mut core.mem, fresh);
        trace!(
            entries = full.num_entries(),
            epoch_flush, finalize, "swapped write buffers"
        );
        core.imm = ImmSlot::Pending {
            buf: full,
            epoch_flush,
            finalize,
        };
        core.num_flush_requested += 1;
        core.has_bg_compaction = true;
        if finalize {
            core.finished = true;
        }

        match &self.options.compaction_pool {
            Some(pool) => {
                let shared = Arc::clone(&self.shared);
                let options = self.options.clone();
                let dir = self.dir.clone();
                pool.execute(Box::new(move || {
                    run_compaction(&shared, &options, &dir);
                }));
                core
            }
            None => {
                // No pool: run the compaction inline on this thread.
                drop(core);
                run_compaction(&self.shared, &self.options, &self.dir);
                self.lock()
            }
        }
    }

    /// Number of keys dropped by `UniqueDrop` deduplication so far.
    pub fn num_dropped_keys(&self) -> u64 {
        self.lock().num_dropped_keys
    }

    /// Output statistics of the underlying table logger. Waits for any
    /// in-flight compaction to hand the logger back.
    pub fn output_stats(&self) -> OutputStats {
        let mut core = self.lock();
        while core.table.is_none() {
            core = self
                .shared
                .cv
                .wait(core)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        core.table.as_ref().map(|t| t.output_stats()).unwrap_or_default()
    }

    /// Sink accounting as `(data, index)`. Waits like `output_stats`.
    pub fn io_stats(&self) -> (IoStats, IoStats) {
        let mut core = self.lock();
        while core.table.is_none() {
            core = self
                .shared
                .cv
                .wait(core)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        core.table.as_ref().map(|t| t.io_stats()).unwrap_or_default()
    }

    /// Approximate memory pinned by the two write buffers.
    pub fn memory_usage(&self) -> usize {
        let core = self.lock();
        let mut total = core.mem.memory_usage();
        if let Some(spare) = &core.spare {
            total += spare.memory_usage();
        }
        if let ImmSlot::Pending { buf, .. } = &core.imm {
            total += buf.memory_usage();
        }
        total
    }
}

// ------------------------------------------------------------------------------------------------
// Compaction
// ------------------------------------------------------------------------------------------------

/// Drains the pending immutable buffer through the table logger.
///
/// Runs on a pool worker (or inline); takes the table logger and filter
/// builder out of the shared state for the duration of the run so the
/// mutex is not held across I/O.
fn run_compaction(shared: &LoggerShared, options: &DirOptions, dir: &Path) {
    let (mut buf, epoch_flush, finalize, mut table, mut filter) = {
        let mut core = shared
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = std::mem::replace(&mut core.imm, ImmSlot::Compacting);
        let (buf, epoch_flush, finalize) = match slot {
            ImmSlot::Pending {
                buf,
                epoch_flush,
                finalize,
            } => (buf, epoch_flush, finalize),
            other => {
                core.imm = other;
                core.has_bg_compaction = false;
                return;
            }
        };
        let table = core.table.take().expect("table logger in use");
        let filter = core.filter.take();
        (buf, epoch_flush, finalize, table, filter)
    };

    let result = compact_buffer(
        &mut buf,
        &mut table,
        filter.as_mut(),
        options,
        dir,
        epoch_flush,
        finalize,
    );
    buf.reset();

    let mut core = shared
        .core
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    core.table = Some(table);
    core.filter = filter;
    core.spare = Some(buf);
    core.imm = ImmSlot::Empty;
    core.num_flush_completed += 1;
    core.has_bg_compaction = false;
    match result {
        Ok(dropped) => core.num_dropped_keys += dropped,
        Err(e) => {
            error!(error = %e, "compaction failed");
            core.latched = Some(e.to_string());
        }
    }
    drop(core);
    shared.cv.notify_all();
}

/// Sorts and streams one buffer into the table logger, applying the
/// duplicate-key mode and feeding the filter builder. Returns the
/// number of entries dropped by deduplication.
fn compact_buffer(
    buf: &mut WriteBuffer,
    table: &mut TableLogger,
    mut filter: Option<&mut FilterBuilder>,
    options: &DirOptions,
    dir: &Path,
    epoch_flush: bool,
    finalize: bool,
) -> Result<u64, DirError> {
    buf.finish_and_sort(options.skip_sort);
    let num_entries = buf.num_entries();
    trace!(num_entries, epoch_flush, finalize, "compacting buffer");

    let mut dropped = 0u64;
    if num_entries > 0 {
        if let Some(f) = filter.as_deref_mut() {
            f.reset(num_entries);
        }
        let mut prev: Option<usize> = None;
        for i in 0..num_entries {
            let (key, value) = buf.entry(i);
            if let Some(p) = prev {
                if buf.entry(p).0 == key {
                    match options.mode {
                        DirMode::Unique => {
                            return Err(DirError::InvalidArgument(
                                "duplicate key rejected in unique mode".into(),
                            ));
                        }
                        DirMode::UniqueDrop => {
                            dropped += 1;
                            continue;
                        }
                        DirMode::MultiMap => {}
                    }
                }
            }
            table.add(key, value)?;
            if let Some(f) = filter.as_deref_mut() {
                f.add_key(key);
            }
            prev = Some(i);
        }
    }

    let filter_payload = match filter {
        Some(f) if num_entries > 0 => Some((f.finish(), f.chunk_type())),
        _ => None,
    };
    table.end_table(
        filter_payload
            .as_ref()
            .map(|(payload, chunk)| (payload.as_slice(), *chunk)),
    )?;

    if epoch_flush {
        table.make_epoch()?;
        if options.epoch_log_rotation && !finalize {
            let path = dir.join(format!("{}.dat.{}", options.rank, table.num_epochs()));
            let file = options.fs.create(&path)?;
            table.rotate_data_log(file)?;
            debug!(path = %path.display(), "rotated epoch data log");
        }
    }

    if finalize {
        if !epoch_flush && table.num_tables_in_epoch() > 0 {
            // Never strand tables outside an epoch.
            table.make_epoch()?;
        }
        table.finish()?;
        info!("directory finalized");
    }
    Ok(dropped)
}

// ------------------------------------------------------------------------------------------------
// DirWriter
// ------------------------------------------------------------------------------------------------

/// Public writer facade of one directory partition.
pub struct DirWriter {
    logger: DirLogger,
}

impl DirWriter {
    /// Opens (creates) a directory partition for writing. Log files are
    /// named after the partition rank: `<rank>.dat` and `<rank>.idx`.
    pub fn open(options: DirOptions, dir: impl AsRef<Path>) -> Result<DirWriter, DirError> {
        let dir = dir.as_ref().to_path_buf();
        options.fs.create_dir_all(&dir)?;

        let data_name = if options.epoch_log_rotation {
            format!("{}.dat.0", options.rank)
        } else {
            format!("{}.dat", options.rank)
        };
        let data_file = options.fs.create(&dir.join(data_name))?;
        let indx_file = options.fs.create(&dir.join(format!("{}.idx", options.rank)))?;

        let data_sink = LogSink::new(data_file, options.min_data_buffer, options.data_buffer);
        let indx_sink = LogSink::new(indx_file, options.min_index_buffer, options.index_buffer);

        let table = TableLogger::new(options.clone(), data_sink, indx_sink);
        let logger = DirLogger::new(options, dir.clone(), table)?;
        info!(dir = %dir.display(), "directory writer opened");
        Ok(DirWriter { logger })
    }

    /// Appends one entry.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<(), DirError> {
        self.logger.add(key, value)
    }

    /// Seals the current epoch: every entry added so far (and not yet
    /// flushed into an earlier epoch) becomes part of it.
    pub fn epoch_flush(&self) -> Result<(), DirError> {
        self.logger.flush(FlushOptions {
            epoch_flush: true,
            ..FlushOptions::default()
        })
    }

    /// Schedules a compaction of the active buffer without an epoch
    /// boundary.
    pub fn flush(&self) -> Result<(), DirError> {
        self.logger.flush(FlushOptions::default())
    }

    /// Seals the final epoch, writes the footer, and syncs the logs.
    /// The directory becomes immutable.
    pub fn finish(&self) -> Result<(), DirError> {
        self.logger.flush(FlushOptions {
            no_wait: false,
            epoch_flush: true,
            finalize: true,
        })
    }

    /// Output statistics of the underlying table logger.
    pub fn output_stats(&self) -> OutputStats {
        self.logger.output_stats()
    }

    /// Sink accounting as `(data, index)`.
    pub fn io_stats(&self) -> (IoStats, IoStats) {
        self.logger.io_stats()
    }

    /// Keys dropped by `UniqueDrop` deduplication.
    pub fn num_dropped_keys(&self) -> u64 {
        self.logger.num_dropped_keys()
    }

    /// Approximate write-buffer memory usage.
    pub fn memory_usage(&self) -> usize {
        self.logger.memory_usage()
    }
}
