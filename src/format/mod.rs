//! # On-Disk Format Primitives
//!
//! Shared wire-format building blocks for the directory logs:
//!
//! - **Varints** — little-endian base-128 integers (7-bit payload, high
//!   bit marks continuation) used by block handles and entry headers.
//! - [`BlockHandle`] — `(offset, size)` pair locating a block inside a
//!   log file.
//! - [`TableHandle`] — the key range of one sorted table plus the
//!   handles of its index and (optional) filter blocks.
//! - [`Footer`] — the fixed-size terminator of an index log. A directory
//!   is only readable once its footer has been written.
//! - [`ChunkType`] — the one-byte tag carried by every block trailer,
//!   distinguishing raw and compressed payloads from filter variants.
//!
//! # Footer layout
//!
//! ```text
//! [root_handle varints, zero-padded to 20 bytes]
//! [u8 mode][u8 filter kind]
//! [18 reserved bytes]
//! [u64 magic LE]
//! ```
//!
//! The footer always occupies the last [`FOOTER_LEN`] bytes of the index
//! log; a magic mismatch is a fatal read error.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Fixed size of the index-log footer in bytes.
pub const FOOTER_LEN: usize = 48;

/// Magic number closing every finished index log.
pub const FOOTER_MAGIC: u64 = 0xfeed_c0de_90a7_51b3;

/// Space reserved for the root handle inside the footer.
const FOOTER_HANDLE_SPACE: usize = 20;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised while decoding wire-format primitives.
#[derive(Debug, Error)]
pub enum FormatError {
    /// A varint ran past the end of the buffer or exceeded 64 bits.
    #[error("varint is truncated or exceeds 64 bits")]
    BadVarint,

    /// An encoded structure ended before all fields were read.
    #[error("encoding is truncated")]
    Truncated,

    /// The footer's magic number did not match.
    #[error("bad footer magic (found {0:#018x})")]
    BadMagic(u64),
}

// ------------------------------------------------------------------------------------------------
// Chunk types
// ------------------------------------------------------------------------------------------------

/// One-byte payload tag stored in every block trailer.
///
/// Data, index, meta-index and root blocks carry `Raw` or `Snappy`;
/// filter blocks carry the tag of the filter family that produced them.
/// Bitmap encodings are further distinguished by the trailing byte of
/// the filter payload itself, not by the chunk type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Uncompressed block payload.
    Raw = 0,

    /// Snappy-compressed block payload.
    Snappy = 1,

    /// Standard bloom filter payload.
    Bloom = 2,

    /// Bitmap filter payload (format tag in the last payload byte).
    Bitmap = 3,

    /// Cuckoo fingerprint filter payload.
    Cuckoo = 4,
}

impl ChunkType {
    /// Decodes a trailer tag. Returns `None` for reserved values.
    pub fn from_u8(tag: u8) -> Option<ChunkType> {
        match tag {
            0 => Some(ChunkType::Raw),
            1 => Some(ChunkType::Snappy),
            2 => Some(ChunkType::Bloom),
            3 => Some(ChunkType::Bitmap),
            4 => Some(ChunkType::Cuckoo),
            _ => None,
        }
    }

    /// Returns true for tags that identify filter payloads.
    pub fn is_filter(self) -> bool {
        matches!(self, ChunkType::Bloom | ChunkType::Bitmap | ChunkType::Cuckoo)
    }
}

// ------------------------------------------------------------------------------------------------
// Varints
// ------------------------------------------------------------------------------------------------

/// Appends `value` to `dst` as a little-endian base-128 varint.
pub fn encode_varint64(dst: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        dst.push((value as u8) | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

/// Decodes a varint from the front of `buf`.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode_varint64(buf: &[u8]) -> Result<(u64, usize), FormatError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(FormatError::BadVarint)
}

/// Appends a length-prefixed byte string to `dst`.
pub fn encode_length_prefixed(dst: &mut Vec<u8>, bytes: &[u8]) {
    encode_varint64(dst, bytes.len() as u64);
    dst.extend_from_slice(bytes);
}

/// Decodes a length-prefixed byte string from the front of `buf`.
///
/// Returns the bytes and the total number of bytes consumed.
pub fn decode_length_prefixed(buf: &[u8]) -> Result<(&[u8], usize), FormatError> {
    let (len, n) = decode_varint64(buf)?;
    let len = len as usize;
    if buf.len() < n + len {
        return Err(FormatError::Truncated);
    }
    Ok((&buf[n..n + len], n + len))
}

// ------------------------------------------------------------------------------------------------
// Block handles
// ------------------------------------------------------------------------------------------------

/// Locates a block inside a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHandle {
    /// Byte offset of the sealed block within its log.
    pub offset: u64,

    /// Sealed size of the block, trailer included.
    pub size: u64,
}

impl BlockHandle {
    /// A handle that points at nothing. Used for absent filter blocks.
    pub const NULL: BlockHandle = BlockHandle { offset: 0, size: 0 };

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// True when this handle does not reference a block.
    pub fn is_null(&self) -> bool {
        self.size == 0
    }

    /// Appends the `(offset, size)` varint pair to `dst`.
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        encode_varint64(dst, self.offset);
        encode_varint64(dst, self.size);
    }

    /// Decodes a handle from the front of `buf`, returning the handle
    /// and the number of bytes consumed.
    pub fn decode_from(buf: &[u8]) -> Result<(BlockHandle, usize), FormatError> {
        let (offset, n0) = decode_varint64(buf)?;
        let (size, n1) = decode_varint64(&buf[n0..])?;
        Ok((BlockHandle { offset, size }, n0 + n1))
    }
}

// ------------------------------------------------------------------------------------------------
// Table handles
// ------------------------------------------------------------------------------------------------

/// Describes one sorted table: its key range, the handle of its index
/// block, and the handle of its optional filter block (null when the
/// table carries no filter).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableHandle {
    /// Smallest user key stored in the table.
    pub smallest_key: Vec<u8>,

    /// Largest user key stored in the table.
    pub largest_key: Vec<u8>,

    /// Index block of the table, in the index log.
    pub index_handle: BlockHandle,

    /// Filter block of the table, in the index log. May be null.
    pub filter_handle: BlockHandle,
}

impl TableHandle {
    /// Serializes the handle.
    pub fn encode(&self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(self.smallest_key.len() + self.largest_key.len() + 24);
        encode_length_prefixed(&mut dst, &self.smallest_key);
        encode_length_prefixed(&mut dst, &self.largest_key);
        self.index_handle.encode_to(&mut dst);
        self.filter_handle.encode_to(&mut dst);
        dst
    }

    /// Decodes a handle from `buf`.
    pub fn decode(buf: &[u8]) -> Result<TableHandle, FormatError> {
        let (smallest, n0) = decode_length_prefixed(buf)?;
        let (largest, n1) = decode_length_prefixed(&buf[n0..])?;
        let (index_handle, n2) = BlockHandle::decode_from(&buf[n0 + n1..])?;
        let (filter_handle, _) = BlockHandle::decode_from(&buf[n0 + n1 + n2..])?;
        Ok(TableHandle {
            smallest_key: smallest.to_vec(),
            largest_key: largest.to_vec(),
            index_handle,
            filter_handle,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Footer
// ------------------------------------------------------------------------------------------------

/// Fixed-size terminator of an index log.
///
/// Carries the root block handle plus two self-describing bytes: the
/// write mode and the filter family the directory was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Handle of the root block (epoch directory).
    pub root_handle: BlockHandle,

    /// Raw mode byte recorded at finish time.
    pub mode: u8,

    /// Raw filter-family byte recorded at finish time.
    pub filter_kind: u8,
}

impl Footer {
    /// Serializes the footer into its fixed [`FOOTER_LEN`]-byte form.
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut handle = Vec::with_capacity(FOOTER_HANDLE_SPACE);
        self.root_handle.encode_to(&mut handle);
        debug_assert!(handle.len() <= FOOTER_HANDLE_SPACE);

        let mut out = [0u8; FOOTER_LEN];
        out[..handle.len()].copy_from_slice(&handle);
        out[FOOTER_HANDLE_SPACE] = self.mode;
        out[FOOTER_HANDLE_SPACE + 1] = self.filter_kind;
        out[FOOTER_LEN - 8..].copy_from_slice(&FOOTER_MAGIC.to_le_bytes());
        out
    }

    /// Decodes and validates a footer from exactly [`FOOTER_LEN`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Footer, FormatError> {
        if buf.len() < FOOTER_LEN {
            return Err(FormatError::Truncated);
        }
        let magic = u64::from_le_bytes(
            buf[FOOTER_LEN - 8..FOOTER_LEN]
                .try_into()
                .map_err(|_| FormatError::Truncated)?,
        );
        if magic != FOOTER_MAGIC {
            return Err(FormatError::BadMagic(magic));
        }
        let (root_handle, _) = BlockHandle::decode_from(&buf[..FOOTER_HANDLE_SPACE])?;
        Ok(Footer {
            root_handle,
            mode: buf[FOOTER_HANDLE_SPACE],
            filter_kind: buf[FOOTER_HANDLE_SPACE + 1],
        })
    }
}
