//! # Table Logger
//!
//! Serializes sorted runs into the two logs of a directory partition.
//! One [`TableLogger`] lives for the lifetime of a directory writer and
//! accumulates, in order:
//!
//! - **data blocks** — sealed into the data sink as entries arrive;
//! - **index blocks** — one per table, mapping each data block's
//!   largest key to its handle, written to the index sink;
//! - **filter blocks** — optional, one per table, written to the index
//!   sink next to the index block;
//! - **meta-index blocks** — one per epoch, mapping each table's
//!   largest key to its [`TableHandle`];
//! - the **root block** — mapping every epoch to its meta-index block —
//!   and the fixed [`Footer`].
//!
//! ## Failure latching
//!
//! The first error is latched: every subsequent operation becomes a
//! no-op returning the captured status, and [`TableLogger::finish`]
//! surfaces it. This keeps a partially-failed compaction from weaving
//! corrupt blocks between good ones.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;

use thiserror::Error;
use tracing::{debug, trace};

use crate::block::{seal_block, seal_filter, BlockBuilder, BlockError};
use crate::format::{BlockHandle, ChunkType, Footer, TableHandle};
use crate::log::{IoStats, LogError, LogSink, WritableLog};
use crate::options::DirOptions;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while logging tables.
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Sink-level failure.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Block encoding failure.
    #[error(transparent)]
    Block(#[from] BlockError),

    /// Contract violation: out-of-order key, operation after finish.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A previous operation failed; the logger refuses further work.
    #[error("table logger already failed: {0}")]
    Latched(String),
}

// ------------------------------------------------------------------------------------------------
// Output statistics
// ------------------------------------------------------------------------------------------------

/// Sizes of everything the logger has produced. Block sizes are final
/// (sealed, trailers included); key/value sizes are raw user bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputStats {
    /// Sealed data block bytes appended to the data log.
    pub data_bytes: u64,

    /// Sealed index block bytes appended to the index log.
    pub index_bytes: u64,

    /// Sealed meta-index and root block bytes.
    pub meta_bytes: u64,

    /// Sealed filter block bytes.
    pub filter_bytes: u64,

    /// Raw user key bytes compacted.
    pub key_bytes: u64,

    /// Raw user value bytes compacted.
    pub value_bytes: u64,

    /// Data blocks sealed.
    pub num_data_blocks: u64,

    /// Tables finalized.
    pub num_tables: u64,
}

// ------------------------------------------------------------------------------------------------
// TableLogger
// ------------------------------------------------------------------------------------------------

/// Writes sorted table contents into a pair of log sinks.
pub struct TableLogger {
    options: DirOptions,

    data_sink: LogSink,
    indx_sink: LogSink,

    data_block: BlockBuilder,
    indx_block: BlockBuilder,
    meta_block: BlockBuilder,
    root_block: BlockBuilder,

    /// Sealed data blocks whose index entries await a commit.
    pending_indx: Vec<(Vec<u8>, BlockHandle)>,

    smallest_key: Vec<u8>,
    largest_key: Vec<u8>,
    table_entries: u64,

    num_tables_in_epoch: u32,
    num_epochs: u32,

    finished: bool,
    latched: Option<String>,

    stats: OutputStats,
}

impl TableLogger {
    /// Creates a logger writing data blocks to `data_sink` and all
    /// index structures to `indx_sink`.
    pub fn new(options: DirOptions, data_sink: LogSink, indx_sink: LogSink) -> Self {
        let restart = options.block_restart_interval;
        Self {
            data_block: BlockBuilder::new(restart),
            indx_block: BlockBuilder::new(restart),
            // Table ranges may overlap within an epoch, so meta keys
            // can arrive out of order.
            meta_block: BlockBuilder::unsorted(restart),
            root_block: BlockBuilder::new(restart),
            pending_indx: Vec::new(),
            smallest_key: Vec::new(),
            largest_key: Vec::new(),
            table_entries: 0,
            num_tables_in_epoch: 0,
            num_epochs: 0,
            finished: false,
            latched: None,
            stats: OutputStats::default(),
            options,
            data_sink,
            indx_sink,
        }
    }

    pub fn ok(&self) -> bool {
        self.latched.is_none()
    }

    pub fn output_stats(&self) -> OutputStats {
        self.stats
    }

    pub fn num_epochs(&self) -> u32 {
        self.num_epochs
    }

    /// Tables ended since the last epoch boundary.
    pub fn num_tables_in_epoch(&self) -> u32 {
        self.num_tables_in_epoch
    }

    /// Write accounting of the two sinks as `(data, index)`.
    pub fn io_stats(&self) -> (IoStats, IoStats) {
        (self.data_sink.io_stats(), self.indx_sink.io_stats())
    }

    fn check_ready(&self) -> Result<(), TableError> {
        if let Some(message) = &self.latched {
            return Err(TableError::Latched(message.clone()));
        }
        if self.finished {
            return Err(TableError::InvalidArgument(
                "directory already finished".into(),
            ));
        }
        Ok(())
    }

    fn latch(&mut self, error: TableError) -> TableError {
        self.latched = Some(error.to_string());
        error
    }

    /// Appends an entry to the active data block. Keys must be
    /// non-decreasing within a table.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), TableError> {
        self.check_ready()?;
        if self.table_entries > 0 && key < self.largest_key.as_slice() {
            return Err(self.latch(TableError::InvalidArgument(
                "keys must be added in non-decreasing order".into(),
            )));
        }

        // Seal before appending if this entry would overflow the block.
        let threshold = (self.options.block_size as f64 * self.options.block_util) as usize;
        let entry_footprint = key.len() + value.len() + 12;
        if !self.data_block.is_empty()
            && self.data_block.size_estimate() + entry_footprint > threshold
        {
            if let Err(e) = self.seal_data_block() {
                return Err(self.latch(e));
            }
        }

        if self.table_entries == 0 {
            self.smallest_key = key.to_vec();
        }
        self.largest_key.clear();
        self.largest_key.extend_from_slice(key);

        self.data_block.add(key, value);
        self.table_entries += 1;
        self.stats.key_bytes += key.len() as u64;
        self.stats.value_bytes += value.len() as u64;
        Ok(())
    }

    /// Ends the current data block, forcing the next entry to start a
    /// fresh one.
    pub fn end_block(&mut self) -> Result<(), TableError> {
        self.check_ready()?;
        self.seal_data_block().map_err(|e| self.latch(e))
    }

    fn seal_data_block(&mut self) -> Result<(), TableError> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let payload = self.data_block.finish();
        self.data_block.reset();
        let sealed = seal_block(
            &payload,
            self.options.compression,
            self.options.force_compression,
        )?;
        let offset = self.data_sink.append(&sealed)?;
        let handle = BlockHandle::new(offset, sealed.len() as u64);

        self.pending_indx.push((self.largest_key.clone(), handle));
        self.stats.data_bytes += sealed.len() as u64;
        self.stats.num_data_blocks += 1;
        trace!(offset, size = sealed.len(), "sealed data block");
        Ok(())
    }

    /// Drains buffered data blocks to the data log and attaches their
    /// pending index entries to the table's index block.
    pub fn commit(&mut self) -> Result<(), TableError> {
        self.check_ready()?;
        self.commit_inner().map_err(|e| self.latch(e))
    }

    fn commit_inner(&mut self) -> Result<(), TableError> {
        self.data_sink.flush_buffered()?;
        for (key, handle) in self.pending_indx.drain(..) {
            let mut encoded = Vec::with_capacity(16);
            handle.encode_to(&mut encoded);
            self.indx_block.add(&key, &encoded);
        }
        Ok(())
    }

    /// Ends the current table: seals and writes its index block and the
    /// optional filter block, and records the table in the epoch's
    /// meta-index. A table with no entries is skipped.
    pub fn end_table(
        &mut self,
        filter: Option<(&[u8], ChunkType)>,
    ) -> Result<(), TableError> {
        self.check_ready()?;
        self.end_table_inner(filter).map_err(|e| self.latch(e))
    }

    fn end_table_inner(
        &mut self,
        filter: Option<(&[u8], ChunkType)>,
    ) -> Result<(), TableError> {
        self.seal_data_block()?;
        self.commit_inner()?;

        if self.table_entries == 0 {
            return Ok(()); // nothing was added since the last table
        }

        let filter_handle = match filter {
            Some((payload, chunk_type)) if !payload.is_empty() => {
                let sealed = seal_filter(payload, chunk_type);
                let offset = self.indx_sink.append(&sealed)?;
                self.stats.filter_bytes += sealed.len() as u64;
                BlockHandle::new(offset, sealed.len() as u64)
            }
            _ => BlockHandle::NULL,
        };

        let payload = self.indx_block.finish();
        self.indx_block.reset();
        let sealed = seal_block(
            &payload,
            self.options.compression,
            self.options.force_compression,
        )?;
        let offset = self.indx_sink.append(&sealed)?;
        let index_handle = BlockHandle::new(offset, sealed.len() as u64);
        self.stats.index_bytes += sealed.len() as u64;

        let table_handle = TableHandle {
            smallest_key: std::mem::take(&mut self.smallest_key),
            largest_key: self.largest_key.clone(),
            index_handle,
            filter_handle,
        };
        self.meta_block
            .add(&table_handle.largest_key, &table_handle.encode());

        debug!(
            epoch = self.num_epochs,
            table = self.num_tables_in_epoch,
            entries = self.table_entries,
            "ended table"
        );

        self.num_tables_in_epoch += 1;
        self.stats.num_tables += 1;
        self.table_entries = 0;
        self.largest_key.clear();
        Ok(())
    }

    /// Seals the epoch's meta-index block and records it in the root
    /// block. An epoch with zero tables still becomes a (searchable,
    /// empty) entry so epoch numbering stays aligned with flushes.
    pub fn make_epoch(&mut self) -> Result<(), TableError> {
        self.check_ready()?;
        debug_assert_eq!(self.table_entries, 0, "end_table must run before make_epoch");
        self.make_epoch_inner().map_err(|e| self.latch(e))
    }

    fn make_epoch_inner(&mut self) -> Result<(), TableError> {
        let payload = self.meta_block.finish();
        self.meta_block.reset();
        let sealed = seal_block(
            &payload,
            self.options.compression,
            self.options.force_compression,
        )?;
        let offset = self.indx_sink.append(&sealed)?;
        self.stats.meta_bytes += sealed.len() as u64;

        let mut encoded = Vec::with_capacity(16);
        BlockHandle::new(offset, sealed.len() as u64).encode_to(&mut encoded);
        self.root_block
            .add(&self.num_epochs.to_be_bytes(), &encoded);

        debug!(
            epoch = self.num_epochs,
            tables = self.num_tables_in_epoch,
            "sealed epoch"
        );
        self.num_epochs += 1;
        self.num_tables_in_epoch = 0;
        Ok(())
    }

    /// Seals the root block, writes the fixed footer, and syncs both
    /// sinks. The directory becomes immutable and readable.
    pub fn finish(&mut self) -> Result<(), TableError> {
        self.check_ready()?;
        self.finish_inner().map_err(|e| self.latch(e))
    }

    fn finish_inner(&mut self) -> Result<(), TableError> {
        let payload = self.root_block.finish();
        self.root_block.reset();
        let sealed = seal_block(
            &payload,
            self.options.compression,
            self.options.force_compression,
        )?;
        let offset = self.indx_sink.append(&sealed)?;
        self.stats.meta_bytes += sealed.len() as u64;

        let footer = Footer {
            root_handle: BlockHandle::new(offset, sealed.len() as u64),
            mode: self.options.mode.as_u8(),
            filter_kind: self.options.filter.as_u8(),
        };
        self.indx_sink.append(&footer.encode())?;

        self.indx_sink.sync()?;
        self.data_sink.sync()?;
        self.finished = true;
        debug!(epochs = self.num_epochs, "finished directory logs");
        Ok(())
    }

    /// Flushes and syncs both sinks without finishing the directory.
    pub fn sync_sinks(&mut self) -> Result<(), TableError> {
        self.data_sink.sync()?;
        self.indx_sink.sync()?;
        Ok(())
    }

    /// Rotates the data log onto a fresh file. Logical offsets keep
    /// running across the rotation, so handles issued before and after
    /// address one contiguous log that a concatenation of the rotated
    /// segments reproduces.
    pub fn rotate_data_log(&mut self, file: Box<dyn WritableLog>) -> Result<(), TableError> {
        self.check_ready()?;
        self.data_sink.rotate(file).map_err(|e| self.latch(e.into()))
    }
}
