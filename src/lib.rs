//! # epochlog
//!
//! An **append-only**, **epoch-structured**, indexed log store for
//! bursty parallel I/O workloads: very large numbers of small records
//! written in waves, later retrieved by exact-key lookup. Each writer
//! produces an ordered sequence of epochs; each epoch produces sorted
//! tables whose data and index streams land in two co-resident log
//! files. A reader resolves a key across all epochs, concatenating
//! every value ever stored under it.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         DirWriter                             │
//! │  add ──► active buffer ──swap──► immutable buffer             │
//! │                                      │  background compaction │
//! │                                      ▼                        │
//! │                                 TableLogger                   │
//! │        data blocks ──► <rank>.dat                             │
//! │        filter / index / meta-index / root ──► <rank>.idx      │
//! └───────────────────────────────────────────────────────────────┘
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         DirReader                             │
//! │  footer → root → meta-index → table (filter) → block → value  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`options`] | Partition configuration — budgets, modes, filters |
//! | [`format`] | Wire primitives — varints, handles, footer, tags |
//! | [`block`] | Prefix-compressed blocks with restart arrays |
//! | [`filter`] | Bloom, bitmap (six encodings) and cuckoo filters |
//! | [`log`] | Buffered sinks, random-access sources, the `Fs` trait |
//! | [`table`] | Streaming table/epoch/root serialization |
//! | [`directory`] | Double-buffered memtable and the write facade |
//! | [`reader`] | Footer-to-block key resolution across epochs |
//! | [`pool`] | Fixed thread pool for compaction and read fan-out |
//!
//! ## Key properties
//!
//! - **Append-only** — no deletes, no updates in place; duplicate keys
//!   accumulate and reads return every stored value in
//!   `(epoch, insertion)` order.
//! - **Burst-friendly** — writes land in memory and are compacted into
//!   sorted tables in the background, one compaction in flight per
//!   partition.
//! - **Filtered lookups** — every table can carry a bloom, bitmap or
//!   cuckoo filter block to keep point-query read amplification down.
//! - **Self-describing logs** — every block ends in a typed, CRC-32C
//!   protected trailer; the index log ends in a fixed magic-bearing
//!   footer. An unfinished directory is not readable.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use epochlog::directory::DirWriter;
//! use epochlog::options::DirOptions;
//! use epochlog::reader::DirReader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = DirOptions::default();
//!
//! let writer = DirWriter::open(options.clone(), "/tmp/plog")?;
//! writer.add(b"k1", b"v1")?;
//! writer.add(b"k2", b"v2")?;
//! writer.epoch_flush()?; // seal epoch 0
//! writer.add(b"k1", b"v3")?;
//! writer.finish()?; // seal epoch 1 + footer
//!
//! let reader = DirReader::open(options, "/tmp/plog")?;
//! assert_eq!(reader.read_all(b"k1")?, b"v1v3".to_vec());
//! assert_eq!(reader.read_all(b"nope")?, Vec::<u8>::new());
//! # Ok(())
//! # }
//! ```

pub mod block;
pub mod directory;
pub mod filter;
pub mod format;
pub mod log;
pub mod options;
pub mod pool;
pub mod reader;
pub mod table;

pub use directory::{DirError, DirWriter};
pub use options::DirOptions;
pub use reader::{DirReader, ReadError};
