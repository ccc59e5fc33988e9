//! # Block Builder / Reader
//!
//! Key-prefix-compressed sorted blocks, the unit of storage in both the
//! data and index logs.
//!
//! ## On-wire layout
//!
//! ```text
//! [Entry 1]
//! ...
//! [Entry N]
//! [restart offset 1: u32 LE]
//! ...
//! [restart offset M: u32 LE]
//! [num restarts: u32 LE]
//! --- sealing ---
//! [chunk type: u8][crc32c over payload+type: u32 LE]
//! ```
//!
//! Each entry is `[varint shared][varint unshared][varint value_len]
//! [key suffix][value]`. Every `block_restart_interval` entries the
//! builder emits a **restart point** whose key is stored uncompressed
//! (`shared == 0`); intermediate entries store only the suffix past the
//! shared prefix with the previous key.
//!
//! ## Sealing
//!
//! [`seal_block`] appends the 1-byte chunk type and the CRC-32C of
//! `payload ‖ type`, optionally Snappy-compressing the payload first.
//! [`unseal_block`] undoes it, verifying length and (when asked) the
//! checksum. The minimum sealed length is the 5-byte trailer.
//!
//! ## Ordering
//!
//! Data and index blocks hold non-decreasing keys and support
//! [`BlockIter::seek`] via binary search over the restart array.
//! Meta-index blocks may hold unsorted keys (table ranges can overlap
//! within an epoch); they are built with [`BlockBuilder::unsorted`] and
//! must be scanned linearly.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use thiserror::Error;

use crate::format::{decode_varint64, encode_varint64, ChunkType, FormatError};
use crate::options::Compression;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Sealed-block trailer: one chunk-type byte plus a 4-byte CRC-32C.
pub const BLOCK_TRAILER_LEN: usize = 5;

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while decoding or verifying blocks.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Structural damage: truncated trailer, bad restart array,
    /// out-of-bounds entry.
    #[error("corrupted block: {0}")]
    Corruption(String),

    /// The stored CRC-32C did not match the payload.
    #[error("block checksum mismatch")]
    ChecksumMismatch,

    /// The compressed payload could not be decoded.
    #[error("snappy error: {0}")]
    Snappy(#[from] snap::Error),

    /// A varint inside an entry header could not be decoded.
    #[error(transparent)]
    Format(#[from] FormatError),
}

// ------------------------------------------------------------------------------------------------
// Sealing
// ------------------------------------------------------------------------------------------------

fn trailer_crc(payload: &[u8], chunk_type: u8) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(payload), &[chunk_type])
}

/// Seals a finished block payload for the data or index log, applying
/// the configured compression and appending the `[type][crc32c]` trailer.
///
/// With `force_compression`, the compressed payload is emitted even when
/// it is not smaller than the raw payload.
pub fn seal_block(
    payload: &[u8],
    compression: Compression,
    force_compression: bool,
) -> Result<Vec<u8>, BlockError> {
    match compression {
        Compression::NoCompression => Ok(seal_raw(payload, ChunkType::Raw)),
        Compression::Snappy => {
            let compressed = snap::raw::Encoder::new().compress_vec(payload)?;
            if compressed.len() < payload.len() || force_compression {
                Ok(seal_raw(&compressed, ChunkType::Snappy))
            } else {
                Ok(seal_raw(payload, ChunkType::Raw))
            }
        }
    }
}

/// Seals a filter payload under its filter chunk type. Filter payloads
/// are never compressed; the chunk type identifies the filter family.
pub fn seal_filter(payload: &[u8], chunk_type: ChunkType) -> Vec<u8> {
    seal_raw(payload, chunk_type)
}

fn seal_raw(payload: &[u8], chunk_type: ChunkType) -> Vec<u8> {
    let tag = chunk_type as u8;
    let mut out = Vec::with_capacity(payload.len() + BLOCK_TRAILER_LEN);
    out.extend_from_slice(payload);
    out.push(tag);
    out.extend_from_slice(&trailer_crc(payload, tag).to_le_bytes());
    out
}

/// Strips and validates a sealed block's trailer.
///
/// Returns the payload (decompressed when the chunk type is Snappy) and
/// the raw chunk-type byte. Unknown chunk types are passed through
/// untouched so that filter dispatch can decide how to treat them.
pub fn unseal_block(sealed: &[u8], verify_checksum: bool) -> Result<(Vec<u8>, u8), BlockError> {
    if sealed.len() < BLOCK_TRAILER_LEN {
        return Err(BlockError::Corruption(format!(
            "sealed block of {} bytes is shorter than the trailer",
            sealed.len()
        )));
    }
    let payload_len = sealed.len() - BLOCK_TRAILER_LEN;
    let payload = &sealed[..payload_len];
    let tag = sealed[payload_len];

    if verify_checksum {
        let stored = u32::from_le_bytes(
            sealed[payload_len + 1..]
                .try_into()
                .map_err(|_| BlockError::Corruption("trailer truncated".into()))?,
        );
        if stored != trailer_crc(payload, tag) {
            return Err(BlockError::ChecksumMismatch);
        }
    }

    if tag == ChunkType::Snappy as u8 {
        let raw = snap::raw::Decoder::new().decompress_vec(payload)?;
        Ok((raw, tag))
    } else {
        Ok((payload.to_vec(), tag))
    }
}

// ------------------------------------------------------------------------------------------------
// Builder
// ------------------------------------------------------------------------------------------------

/// Builds one prefix-compressed block.
///
/// Keys handed to [`BlockBuilder::add`] must be non-decreasing unless
/// the builder was created with [`BlockBuilder::unsorted`].
pub struct BlockBuilder {
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    num_entries: usize,
    last_key: Vec<u8>,
    sorted: bool,
}

impl BlockBuilder {
    /// Creates a builder for a sorted block.
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: Vec::new(),
            restarts: Vec::new(),
            restart_interval: restart_interval.max(1),
            counter: 0,
            num_entries: 0,
            last_key: Vec::new(),
            sorted: true,
        }
    }

    /// Creates a builder whose keys may arrive in any order. Blocks
    /// built this way only support linear iteration, not seeking.
    pub fn unsorted(restart_interval: usize) -> Self {
        let mut builder = Self::new(restart_interval);
        builder.sorted = false;
        builder
    }

    /// Appends an entry.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(
            !self.sorted || self.num_entries == 0 || key >= self.last_key.as_slice(),
            "keys must be non-decreasing in a sorted block"
        );

        let shared = if self.counter >= self.restart_interval || self.num_entries == 0 {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            0
        } else if self.sorted {
            shared_prefix_len(&self.last_key, key)
        } else {
            0
        };

        encode_varint64(&mut self.buffer, shared as u64);
        encode_varint64(&mut self.buffer, (key.len() - shared) as u64);
        encode_varint64(&mut self.buffer, value.len() as u64);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
        self.num_entries += 1;
    }

    /// Finalizes the block and returns its payload (not yet sealed).
    /// Call [`BlockBuilder::reset`] before reusing the builder.
    pub fn finish(&mut self) -> Vec<u8> {
        for restart in &self.restarts {
            self.buffer.extend_from_slice(&restart.to_le_bytes());
        }
        self.buffer
            .extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        std::mem::take(&mut self.buffer)
    }

    /// Re-arms the builder for the next block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.counter = 0;
        self.num_entries = 0;
        self.last_key.clear();
    }

    /// Estimated payload size if the block were finished now.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * U32_SIZE + U32_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// A decoded (unsealed) block payload ready for iteration.
pub struct Block {
    data: Vec<u8>,
    restart_offset: usize,
    num_restarts: usize,
}

impl Block {
    /// Parses a block payload. The payload must already be unsealed.
    pub fn new(data: Vec<u8>) -> Result<Self, BlockError> {
        if data.len() < U32_SIZE {
            return Err(BlockError::Corruption("block payload too small".into()));
        }
        let num_restarts = u32::from_le_bytes(
            data[data.len() - U32_SIZE..]
                .try_into()
                .map_err(|_| BlockError::Corruption("restart count truncated".into()))?,
        ) as usize;

        let tail = U32_SIZE + num_restarts * U32_SIZE;
        if tail > data.len() {
            return Err(BlockError::Corruption("restart array out of bounds".into()));
        }
        let restart_offset = data.len() - tail;

        Ok(Self {
            data,
            restart_offset,
            num_restarts,
        })
    }

    pub fn num_restarts(&self) -> usize {
        self.num_restarts
    }

    fn restart_point(&self, index: usize) -> usize {
        let at = self.restart_offset + index * U32_SIZE;
        u32::from_le_bytes(self.data[at..at + U32_SIZE].try_into().unwrap()) as usize
    }

    /// Reads the full key stored at a restart point. Restart entries
    /// always store `shared == 0`.
    fn restart_key(&self, index: usize) -> Result<&[u8], BlockError> {
        let at = self.restart_point(index);
        let buf = &self.data[at..self.restart_offset];
        let (shared, n0) = decode_varint64(buf)?;
        if shared != 0 {
            return Err(BlockError::Corruption(
                "restart entry has a shared prefix".into(),
            ));
        }
        let (unshared, n1) = decode_varint64(&buf[n0..])?;
        let (_, n2) = decode_varint64(&buf[n0 + n1..])?;
        let start = n0 + n1 + n2;
        let end = start + unshared as usize;
        if end > buf.len() {
            return Err(BlockError::Corruption("restart entry out of bounds".into()));
        }
        Ok(&buf[start..end])
    }

    /// Returns an iterator positioned before the first entry.
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            offset: 0,
            last_key: Vec::new(),
        }
    }
}

/// Forward iterator over a block's entries.
///
/// Yields `(key, value)` pairs; a decoding failure surfaces as one
/// `Err` item after which iteration stops.
pub struct BlockIter<'a> {
    block: &'a Block,
    offset: usize,
    last_key: Vec<u8>,
}

impl<'a> BlockIter<'a> {
    /// Repositions the iterator so the next entry returned is the first
    /// one whose key is `>= target`.
    ///
    /// Only valid on sorted blocks: binary-searches the restart array,
    /// then scans forward.
    pub fn seek(&mut self, target: &[u8]) -> Result<(), BlockError> {
        // Find the last restart point whose key is < target; entries at
        // earlier offsets cannot contain the target.
        let mut left = 0usize;
        let mut right = self.block.num_restarts;
        while left < right {
            let mid = left + (right - left) / 2;
            if self.block.restart_key(mid)? < target {
                left = mid + 1;
            } else {
                right = mid;
            }
        }
        let restart_index = left.saturating_sub(1);

        self.offset = if self.block.num_restarts == 0 {
            self.block.restart_offset
        } else {
            self.block.restart_point(restart_index)
        };
        self.last_key.clear();

        // Scan forward until the next entry is >= target.
        loop {
            let probe = self.offset;
            let prefix_state = self.last_key.clone();
            match self.decode_next()? {
                Some((key, _)) => {
                    if key.as_slice() >= target {
                        // Rewind one entry: restore the cursor and the
                        // prefix state so next() re-yields it.
                        self.offset = probe;
                        self.last_key = prefix_state;
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    fn decode_next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BlockError> {
        if self.offset >= self.block.restart_offset {
            return Ok(None);
        }
        let buf = &self.block.data[self.offset..self.block.restart_offset];
        let (shared, n0) = decode_varint64(buf)?;
        let (unshared, n1) = decode_varint64(&buf[n0..])?;
        let (value_len, n2) = decode_varint64(&buf[n0 + n1..])?;
        let shared = shared as usize;
        let unshared = unshared as usize;
        let value_len = value_len as usize;

        let header = n0 + n1 + n2;
        if shared > self.last_key.len() || header + unshared + value_len > buf.len() {
            return Err(BlockError::Corruption("entry out of bounds".into()));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&self.last_key[..shared]);
        key.extend_from_slice(&buf[header..header + unshared]);
        let value = buf[header + unshared..header + unshared + value_len].to_vec();

        self.offset += header + unshared + value_len;
        self.last_key.clear();
        self.last_key.extend_from_slice(&key);

        Ok(Some((key, value)))
    }
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = Result<(Vec<u8>, Vec<u8>), BlockError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.decode_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                // Stop after surfacing the failure once.
                self.offset = self.block.restart_offset;
                Some(Err(e))
            }
        }
    }
}
