//! # Directory Options
//!
//! Construction-time configuration for directory writers and readers.
//! One [`DirOptions`] value describes a single directory partition: how
//! much memory its write buffers may use, how blocks are sized and
//! compressed, which probabilistic filter accompanies each table, and
//! which injected collaborators (filesystem, thread pools) the partition
//! runs on.
//!
//! Options are plain data; they are cloned into every component that
//! needs them at open time and never change afterwards.

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::Arc;

use crate::log::{DiskFs, Fs};
use crate::pool::ThreadPool;

// ------------------------------------------------------------------------------------------------
// Mode / filter selection
// ------------------------------------------------------------------------------------------------

/// Duplicate-key policy applied during compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirMode {
    /// All keys in a compaction unit must be distinct; a duplicate is an
    /// error.
    Unique,

    /// Keep the first entry per key, silently dropping (and counting)
    /// later duplicates.
    UniqueDrop,

    /// Preserve every entry, duplicates included.
    MultiMap,
}

impl DirMode {
    /// Footer representation of the mode.
    pub fn as_u8(self) -> u8 {
        match self {
            DirMode::Unique => 0,
            DirMode::UniqueDrop => 1,
            DirMode::MultiMap => 2,
        }
    }
}

/// Filter family attached to each table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// No filter blocks are written.
    NoFilter,

    /// Standard bloom filter, sized by `bf_bits_per_key`.
    Bloom,

    /// Exact bitmap filter over a `[0, 2^bm_key_bits)` key domain,
    /// encoded per `bitmap_format`.
    Bitmap,

    /// Cuckoo fingerprint filter, sized by `filter_bits_per_key`.
    Cuckoo,
}

impl FilterKind {
    /// Footer representation of the filter family.
    pub fn as_u8(self) -> u8 {
        match self {
            FilterKind::NoFilter => 0,
            FilterKind::Bloom => 1,
            FilterKind::Bitmap => 2,
            FilterKind::Cuckoo => 3,
        }
    }
}

/// On-disk encoding of a bitmap filter payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitmapFormat {
    /// Dense `2^bm_key_bits`-bit array.
    Uncompressed,

    /// Sorted indices, gaps encoded as varints.
    Varint,

    /// Varint gaps with a one-byte fast path for gaps up to 254.
    VarintPlus,

    /// Gaps bit-packed in cohorts of 128 behind per-cohort width bytes.
    PForDelta,

    /// Per-bucket sorted low-byte offsets with a packed size table.
    Roaring,

    /// Roaring with a cumulative count prefix for O(1) bucket jumps.
    PartitionedRoaring,
}

/// Block payload compression applied to data and index blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Store payloads as written.
    NoCompression,

    /// Snappy-compress payloads before sealing.
    Snappy,
}

// ------------------------------------------------------------------------------------------------
// DirOptions
// ------------------------------------------------------------------------------------------------

/// Configuration of one directory partition.
#[derive(Clone)]
pub struct DirOptions {
    /// Aggregate RAM for the active + immutable write buffers of this
    /// directory, before partition fan-out.
    pub total_memtable_budget: usize,

    /// Target sealed size of a data block.
    pub block_size: usize,

    /// Fill factor applied to `block_size` before a block is sealed.
    pub block_util: f64,

    /// Entries between restart points inside a block.
    pub block_restart_interval: usize,

    /// log2 of the number of partitions sharing `total_memtable_budget`.
    /// This partition sizes its buffers as `budget >> lg_parts`.
    pub lg_parts: usize,

    /// Rank of this partition; names the log files (`<rank>.dat`,
    /// `<rank>.idx`).
    pub rank: u32,

    /// Expected key size, used to estimate entries per table.
    pub key_size: usize,

    /// Expected value size, used to estimate entries per table.
    pub value_size: usize,

    /// Duplicate-key policy.
    pub mode: DirMode,

    /// Assert that keys arrive pre-sorted instead of sorting on flush.
    pub skip_sort: bool,

    /// Fail writes with `Busy` instead of waiting for the immutable
    /// buffer to drain.
    pub non_blocking: bool,

    /// Payload compression for data/index/meta/root blocks.
    pub compression: Compression,

    /// Emit the compressed payload even when it is not smaller.
    pub force_compression: bool,

    /// Filter family written alongside each table.
    pub filter: FilterKind,

    /// Bloom filter budget in bits per key. Zero disables the bloom
    /// filter even when `filter` selects it.
    pub bf_bits_per_key: usize,

    /// Fingerprint width for the cuckoo filter. Supported widths:
    /// 10, 16, 20, 24 and 32 bits.
    pub filter_bits_per_key: usize,

    /// Encoding used for bitmap filter payloads.
    pub bitmap_format: BitmapFormat,

    /// Bitmap key-domain width: keys map into `[0, 2^bm_key_bits)`.
    pub bm_key_bits: usize,

    /// Target cuckoo table occupancy in `(0, 1]`.
    pub cuckoo_frac: f64,

    /// Eviction bound per cuckoo insertion before spilling to the
    /// victim set.
    pub cuckoo_max_moves: usize,

    /// Seed for the cuckoo filter's eviction choices.
    pub cuckoo_seed: u64,

    /// Write-buffer capacity of the data sink.
    pub data_buffer: usize,

    /// Buffered bytes that trigger a data sink flush.
    pub min_data_buffer: usize,

    /// Write-buffer capacity of the index sink.
    pub index_buffer: usize,

    /// Buffered bytes that trigger an index sink flush.
    pub min_index_buffer: usize,

    /// Verify block CRCs on read.
    pub verify_checksums: bool,

    /// Surface unknown filter encodings as errors instead of degrading
    /// to a full block scan.
    pub paranoid_checks: bool,

    /// Rotate the data log at each epoch boundary
    /// (`<rank>.dat.<epoch>`).
    pub epoch_log_rotation: bool,

    /// Pool running background compactions. With `None`, compactions
    /// run inline on the calling thread.
    pub compaction_pool: Option<Arc<dyn ThreadPool>>,

    /// Pool running per-epoch read fan-out. With `None`, epochs are
    /// read sequentially.
    pub reader_pool: Option<Arc<dyn ThreadPool>>,

    /// Filesystem the partition's logs live on.
    pub fs: Arc<dyn Fs>,
}

impl Default for DirOptions {
    fn default() -> Self {
        Self {
            total_memtable_budget: 32 << 20,
            block_size: 32 << 10,
            block_util: 0.996,
            block_restart_interval: 16,
            lg_parts: 0,
            rank: 0,
            key_size: 8,
            value_size: 32,
            mode: DirMode::Unique,
            skip_sort: false,
            non_blocking: false,
            compression: Compression::NoCompression,
            force_compression: false,
            filter: FilterKind::Bloom,
            bf_bits_per_key: 8,
            filter_bits_per_key: 16,
            bitmap_format: BitmapFormat::Uncompressed,
            bm_key_bits: 24,
            cuckoo_frac: 0.95,
            cuckoo_max_moves: 500,
            cuckoo_seed: 301,
            data_buffer: 4 << 20,
            min_data_buffer: 4 << 20,
            index_buffer: 4 << 20,
            min_index_buffer: 4 << 20,
            verify_checksums: false,
            paranoid_checks: false,
            epoch_log_rotation: false,
            compaction_pool: None,
            reader_pool: None,
            fs: Arc::new(DiskFs),
        }
    }
}

impl DirOptions {
    /// Memory budget of a single write buffer of this partition: half
    /// of the per-partition share of `total_memtable_budget`.
    pub fn buffer_budget(&self) -> usize {
        (self.total_memtable_budget >> self.lg_parts) / 2
    }

    /// Estimated number of entries one table (one flushed buffer) will
    /// hold, used to pre-size filters.
    pub fn entries_per_table(&self) -> usize {
        let entry = self.key_size + self.value_size;
        (self.buffer_budget() / entry.max(1)).max(1)
    }
}
