//! # Filter Blocks
//!
//! Probabilistic membership filters written alongside each table so the
//! reader can skip tables that cannot contain a key. Three families
//! exist behind one capability set (`reset`, `add_key`, `finish`,
//! `chunk_type`) and one stateless dispatcher
//! ([`filter_may_match`]) indexed by the chunk-type byte persisted with
//! the filter payload:
//!
//! - **Bloom** — classic double-hashed k-probe bloom filter. May return
//!   false positives, never false negatives.
//! - **Bitmap** — exact membership over a bounded key domain
//!   `[0, 2^bm_key_bits)`, with six interchangeable payload encodings
//!   selected by the trailing byte of the payload. No false positives
//!   and no false negatives within the domain.
//! - **Cuckoo** — fingerprint filter with two candidate buckets per key
//!   and bounded eviction. Keys whose fingerprint spilled to the
//!   in-memory victim set may read as absent.
//!
//! Builders are cached across compactions inside a [`FilterBuilder`]
//! tagged variant and re-armed per table via `reset(num_keys)`.
//!
//! Unknown encodings degrade to "may match" on read unless
//! `paranoid_checks` is set, preserving compatibility with filter bytes
//! written by newer formats.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::warn;

use crate::format::ChunkType;
use crate::options::{BitmapFormat, DirOptions, FilterKind};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Fingerprint widths the cuckoo filter can serialize.
pub const CUCKOO_WIDTHS: [usize; 5] = [10, 16, 20, 24, 32];

const CUCKOO_ITEMS_PER_BUCKET: usize = 4;
const CUCKOO_TRAILER_LEN: usize = 8;

/// Bitmap payload format tags (trailing byte of the payload).
const BM_TAG_UNCOMPRESSED: u8 = 0;
const BM_TAG_VARINT: u8 = 1;
const BM_TAG_VARINT_PLUS: u8 = 2;
const BM_TAG_PFOR_DELTA: u8 = 3;
const BM_TAG_ROARING: u8 = 4;
const BM_TAG_P_ROARING: u8 = 5;

const PFOR_COHORT: usize = 128;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors raised by filter construction and dispatch.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The persisted filter carries an encoding this build cannot read.
    #[error("unsupported filter encoding (tag {0})")]
    NotSupported(u8),

    /// The configured cuckoo fingerprint width is not serializable.
    #[error("unsupported cuckoo fingerprint width {0}")]
    UnsupportedWidth(usize),
}

// ------------------------------------------------------------------------------------------------
// Hashing
// ------------------------------------------------------------------------------------------------

fn fnv1a_seeded(data: &[u8], seed: u32) -> u32 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325 ^ u64::from(seed);
    for &byte in data {
        h ^= u64::from(byte);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (h ^ (h >> 32)) as u32
}

fn bloom_hash(key: &[u8]) -> u32 {
    fnv1a_seeded(key, 0xbc9f_1d34)
}

fn cuckoo_hash(key: &[u8]) -> u32 {
    fnv1a_seeded(key, 0x9e37_79b9)
}

fn cuckoo_fp_hash(fp: u32) -> u32 {
    fnv1a_seeded(&fp.to_le_bytes(), 0xd0e8_9c7b)
}

// ------------------------------------------------------------------------------------------------
// Bit packing helpers
// ------------------------------------------------------------------------------------------------

fn bits_needed(x: u32) -> usize {
    (32 - x.leading_zeros()) as usize
}

fn write_bits(buf: &mut [u8], bit_offset: usize, width: usize, value: u32) {
    for i in 0..width {
        if value >> i & 1 == 1 {
            let pos = bit_offset + i;
            buf[pos / 8] |= 1 << (pos % 8);
        }
    }
}

fn read_bits(buf: &[u8], bit_offset: usize, width: usize) -> u32 {
    let mut value = 0u32;
    for i in 0..width {
        let pos = bit_offset + i;
        if pos / 8 < buf.len() && buf[pos / 8] >> (pos % 8) & 1 == 1 {
            value |= 1 << i;
        }
    }
    value
}

// ------------------------------------------------------------------------------------------------
// Bloom filter
// ------------------------------------------------------------------------------------------------

/// Standard bloom filter block builder.
///
/// The serialized payload is the bit array followed by one byte storing
/// the probe count `k`, so filters written with different parameters
/// remain readable.
pub struct BloomBlock {
    bits_per_key: usize,
    k: u32,
    bits: u32,
    space: Vec<u8>,
    finished: bool,
}

impl BloomBlock {
    pub fn new(bits_per_key: usize) -> Self {
        // Round down to reduce probing cost a little bit.
        let k = ((bits_per_key as f64) * 0.69) as u32; // 0.69 =~ ln(2)
        Self {
            bits_per_key,
            k: k.clamp(1, 30),
            bits: 0,
            space: Vec::new(),
            finished: true, // pending reset
        }
    }

    pub fn chunk_type(&self) -> ChunkType {
        ChunkType::Bloom
    }

    /// Re-arms the filter for `num_keys` insertions.
    pub fn reset(&mut self, num_keys: usize) {
        // A very short filter sees a very high false positive rate;
        // enforce a minimum length.
        let bits = ((num_keys * self.bits_per_key) as u32).max(64);
        let bytes = bits.div_ceil(8);
        self.space.clear();
        self.space.resize(bytes as usize, 0);
        self.space.push(self.k as u8);
        self.bits = bytes * 8;
        self.finished = false;
    }

    pub fn add_key(&mut self, key: &[u8]) {
        debug_assert!(!self.finished);
        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..self.k {
            let bit = h % self.bits;
            self.space[(bit / 8) as usize] |= 1 << (bit % 8);
            h = h.wrapping_add(delta);
        }
    }

    pub fn finish(&mut self) -> Vec<u8> {
        debug_assert!(!self.finished);
        self.finished = true;
        self.space.clone()
    }
}

/// Tests `key` against a serialized bloom payload.
///
/// Never returns false for a key that was inserted. Malformed payloads
/// (too short, reserved probe counts) are treated as a match.
pub fn bloom_key_may_match(key: &[u8], payload: &[u8]) -> bool {
    if payload.len() < 2 {
        return true;
    }
    let bits = ((payload.len() - 1) * 8) as u32;
    // Use the stored k so filters built with other parameters stay
    // readable; k above 30 is reserved for future encodings.
    let k = payload[payload.len() - 1];
    if k > 30 {
        return true;
    }

    let mut h = bloom_hash(key);
    let delta = h.rotate_right(17);
    for _ in 0..k {
        let bit = h % bits;
        if payload[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
            return false;
        }
        h = h.wrapping_add(delta);
    }
    true
}

// ------------------------------------------------------------------------------------------------
// Bitmap filters
// ------------------------------------------------------------------------------------------------

/// Maps a key into the bitmap domain: the first four key bytes are
/// read as a little-endian u32 (zero-padded when shorter) and masked
/// down to `key_bits`.
fn key_to_index(key: &[u8], mask: u32) -> u32 {
    let mut tmp = [0u8; 4];
    let n = key.len().min(4);
    tmp[..n].copy_from_slice(&key[..n]);
    u32::from_le_bytes(tmp) & mask
}

/// Exact-membership bitmap filter block builder.
///
/// Collects inserted indices and serializes them on `finish` in the
/// configured [`BitmapFormat`]. The payload ends with one byte holding
/// the domain width in bits and one byte holding the format tag; the
/// reader dispatches on that trailing tag.
pub struct BitmapBlock {
    key_bits: usize,
    mask: u32,
    format: BitmapFormat,
    indices: Vec<u32>,
    finished: bool,
}

impl BitmapBlock {
    pub fn new(key_bits: usize, format: BitmapFormat) -> Self {
        let key_bits = key_bits.min(32);
        let mask = if key_bits == 32 {
            u32::MAX
        } else {
            (1u32 << key_bits) - 1
        };
        Self {
            key_bits,
            mask,
            format,
            indices: Vec::new(),
            finished: true, // pending reset
        }
    }

    pub fn chunk_type(&self) -> ChunkType {
        ChunkType::Bitmap
    }

    pub fn reset(&mut self, num_keys: usize) {
        self.indices.clear();
        self.indices.reserve(num_keys);
        self.finished = false;
    }

    /// Inserts a key. Only the first four key bytes participate; keys
    /// outside the declared domain are folded in by the mask.
    pub fn add_key(&mut self, key: &[u8]) {
        debug_assert!(!self.finished);
        self.indices.push(key_to_index(key, self.mask));
    }

    pub fn finish(&mut self) -> Vec<u8> {
        debug_assert!(!self.finished);
        self.finished = true;

        self.indices.sort_unstable();
        self.indices.dedup();

        let mut payload = match self.format {
            BitmapFormat::Uncompressed => encode_uncompressed(&self.indices, self.key_bits),
            BitmapFormat::Varint => encode_varint_gaps(&self.indices, false),
            BitmapFormat::VarintPlus => encode_varint_gaps(&self.indices, true),
            BitmapFormat::PForDelta => encode_pfor_delta(&self.indices),
            BitmapFormat::Roaring => encode_roaring(&self.indices, self.key_bits),
            BitmapFormat::PartitionedRoaring => encode_p_roaring(&self.indices, self.key_bits),
        };
        payload.push(self.key_bits as u8);
        payload.push(bitmap_format_tag(self.format));
        payload
    }
}

fn bitmap_format_tag(format: BitmapFormat) -> u8 {
    match format {
        BitmapFormat::Uncompressed => BM_TAG_UNCOMPRESSED,
        BitmapFormat::Varint => BM_TAG_VARINT,
        BitmapFormat::VarintPlus => BM_TAG_VARINT_PLUS,
        BitmapFormat::PForDelta => BM_TAG_PFOR_DELTA,
        BitmapFormat::Roaring => BM_TAG_ROARING,
        BitmapFormat::PartitionedRoaring => BM_TAG_P_ROARING,
    }
}

fn encode_uncompressed(indices: &[u32], key_bits: usize) -> Vec<u8> {
    let bits = 1usize << key_bits;
    let mut out = vec![0u8; bits.div_ceil(8)];
    for &i in indices {
        out[(i / 8) as usize] |= 1 << (i % 8);
    }
    out
}

fn push_varint32(out: &mut Vec<u8>, mut v: u32) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn read_varint32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let mut v: u32 = 0;
    for i in 0..5 {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        v |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some(v);
        }
    }
    None
}

/// Gap encoding shared by the Varint and VarintPlus formats: the first
/// gap is the first index, later gaps are deltas between consecutive
/// distinct indices. VarintPlus stores gaps up to 254 in one byte and
/// escapes larger gaps with `0xFF` followed by a varint of `gap - 254`.
fn encode_varint_gaps(indices: &[u32], plus: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = 0u32;
    for (n, &i) in indices.iter().enumerate() {
        let gap = if n == 0 { i } else { i - prev };
        if plus {
            if gap <= 254 {
                out.push(gap as u8);
            } else {
                out.push(0xff);
                push_varint32(&mut out, gap - 254);
            }
        } else {
            push_varint32(&mut out, gap);
        }
        prev = i;
    }
    out
}

fn test_varint_gaps(index: u32, payload: &[u8], plus: bool) -> bool {
    let mut pos = 0usize;
    let mut value = 0u32;
    let mut first = true;
    while pos < payload.len() {
        let gap = if plus {
            let byte = payload[pos];
            pos += 1;
            if byte == 0xff {
                match read_varint32(payload, &mut pos) {
                    Some(rest) => rest + 254,
                    None => return false,
                }
            } else {
                u32::from(byte)
            }
        } else {
            match read_varint32(payload, &mut pos) {
                Some(gap) => gap,
                None => return false,
            }
        };
        value = if first { gap } else { value + gap };
        first = false;
        if value == index {
            return true;
        }
        if value > index {
            return false;
        }
    }
    false
}

/// Gaps bit-packed in cohorts of 128 behind a one-byte width header.
/// A u32 count prefix disambiguates the final short cohort.
fn encode_pfor_delta(indices: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(indices.len() as u32).to_le_bytes());

    let mut prev = 0u32;
    let mut gaps = Vec::with_capacity(indices.len());
    for (n, &i) in indices.iter().enumerate() {
        gaps.push(if n == 0 { i } else { i - prev });
        prev = i;
    }

    for cohort in gaps.chunks(PFOR_COHORT) {
        let max_gap = cohort.iter().copied().max().unwrap_or(0);
        let width = bits_needed(max_gap).max(1);
        out.push(width as u8);
        let start = out.len();
        out.resize(start + (cohort.len() * width).div_ceil(8), 0);
        for (j, &gap) in cohort.iter().enumerate() {
            write_bits(&mut out[start..], j * width, width, gap);
        }
    }
    out
}

fn test_pfor_delta(index: u32, payload: &[u8]) -> bool {
    if payload.len() < 4 {
        return false;
    }
    let count = u32::from_le_bytes(payload[..4].try_into().unwrap()) as usize;
    let mut pos = 4usize;
    let mut remaining = count;
    let mut value = 0u32;
    let mut first = true;
    while remaining > 0 {
        let Some(&width) = payload.get(pos) else {
            return false;
        };
        let width = width as usize;
        pos += 1;
        let in_cohort = remaining.min(PFOR_COHORT);
        let nbytes = (in_cohort * width).div_ceil(8);
        if pos + nbytes > payload.len() || width == 0 {
            return false;
        }
        for j in 0..in_cohort {
            let gap = read_bits(&payload[pos..pos + nbytes], j * width, width);
            value = if first { gap } else { value + gap };
            first = false;
            if value == index {
                return true;
            }
            if value > index {
                return false;
            }
        }
        pos += nbytes;
        remaining -= in_cohort;
    }
    false
}

fn roaring_buckets(key_bits: usize) -> usize {
    1usize << key_bits.saturating_sub(8)
}

/// Per-bucket sorted low-byte offsets. Bucket sizes are bit-packed at a
/// uniform width recorded in the leading byte.
fn encode_roaring(indices: &[u32], key_bits: usize) -> Vec<u8> {
    let num_buckets = roaring_buckets(key_bits);
    let mut sizes = vec![0u32; num_buckets];
    for &i in indices {
        sizes[(i >> 8) as usize] += 1;
    }
    let max_size = sizes.iter().copied().max().unwrap_or(0);
    let width = bits_needed(max_size).max(1);

    let mut out = Vec::new();
    out.push(width as u8);
    let start = out.len();
    out.resize(start + (num_buckets * width).div_ceil(8), 0);
    for (b, &size) in sizes.iter().enumerate() {
        write_bits(&mut out[start..], b * width, width, size);
    }
    for &i in indices {
        out.push((i & 0xff) as u8);
    }
    out
}

fn test_roaring(index: u32, key_bits: usize, payload: &[u8]) -> bool {
    if payload.is_empty() {
        return false;
    }
    let width = payload[0] as usize;
    let num_buckets = roaring_buckets(key_bits);
    let sizes_bytes = (num_buckets * width).div_ceil(8);
    if width == 0 || 1 + sizes_bytes > payload.len() {
        return false;
    }
    let sizes = &payload[1..1 + sizes_bytes];

    let bucket = (index >> 8) as usize;
    if bucket >= num_buckets {
        return false;
    }
    let mut start = 0usize;
    for b in 0..bucket {
        start += read_bits(sizes, b * width, width) as usize;
    }
    let size = read_bits(sizes, bucket * width, width) as usize;

    let lows = &payload[1 + sizes_bytes..];
    let low = (index & 0xff) as u8;
    lows.get(start..start + size)
        .is_some_and(|bucket_lows| bucket_lows.binary_search(&low).is_ok())
}

/// Roaring with a fixed-width u16 count per bucket, so the reader jumps
/// from partition to partition without unpacking a size table.
fn encode_p_roaring(indices: &[u32], key_bits: usize) -> Vec<u8> {
    let num_buckets = roaring_buckets(key_bits);
    let mut sizes = vec![0u16; num_buckets];
    for &i in indices {
        sizes[(i >> 8) as usize] += 1;
    }

    let mut out = Vec::with_capacity(num_buckets * 2 + indices.len());
    for &size in &sizes {
        out.extend_from_slice(&size.to_le_bytes());
    }
    for &i in indices {
        out.push((i & 0xff) as u8);
    }
    out
}

fn test_p_roaring(index: u32, key_bits: usize, payload: &[u8]) -> bool {
    let num_buckets = roaring_buckets(key_bits);
    if payload.len() < num_buckets * 2 {
        return false;
    }
    let bucket = (index >> 8) as usize;
    if bucket >= num_buckets {
        return false;
    }
    let mut start = 0usize;
    for b in 0..bucket {
        start += u16::from_le_bytes(payload[b * 2..b * 2 + 2].try_into().unwrap()) as usize;
    }
    let size =
        u16::from_le_bytes(payload[bucket * 2..bucket * 2 + 2].try_into().unwrap()) as usize;

    let lows = &payload[num_buckets * 2..];
    let low = (index & 0xff) as u8;
    lows.get(start..start + size)
        .is_some_and(|bucket_lows| bucket_lows.binary_search(&low).is_ok())
}

/// Tests `key` against a serialized bitmap payload, dispatching on the
/// trailing format tag.
///
/// Exact within the declared domain: returns true iff the key's index
/// was inserted. An unknown format tag is `NotSupported`.
pub fn bitmap_key_may_match(key: &[u8], payload: &[u8]) -> Result<bool, FilterError> {
    if payload.len() < 2 {
        return Ok(true);
    }
    let tag = payload[payload.len() - 1];
    let key_bits = (payload[payload.len() - 2] as usize).min(32);
    let body = &payload[..payload.len() - 2];
    let mask = if key_bits == 32 {
        u32::MAX
    } else {
        (1u32 << key_bits) - 1
    };
    let index = key_to_index(key, mask);

    match tag {
        BM_TAG_UNCOMPRESSED => Ok(body
            .get((index / 8) as usize)
            .is_some_and(|byte| byte & (1 << (index % 8)) != 0)),
        BM_TAG_VARINT => Ok(test_varint_gaps(index, body, false)),
        BM_TAG_VARINT_PLUS => Ok(test_varint_gaps(index, body, true)),
        BM_TAG_PFOR_DELTA => Ok(test_pfor_delta(index, body)),
        BM_TAG_ROARING => Ok(test_roaring(index, key_bits, body)),
        BM_TAG_P_ROARING => Ok(test_p_roaring(index, key_bits, body)),
        other => Err(FilterError::NotSupported(other)),
    }
}

// ------------------------------------------------------------------------------------------------
// Cuckoo filter
// ------------------------------------------------------------------------------------------------

/// Cuckoo fingerprint filter block builder.
///
/// Four fingerprints per bucket, bit-packed at the configured width.
/// Insertion tries both candidate buckets and evicts up to
/// `max_moves` residents before spilling the fingerprint into the
/// in-memory victim set; spilled fingerprints are not serialized.
pub struct CuckooBlock {
    bits_per_key: usize,
    frac: f64,
    max_moves: usize,
    rng: StdRng,
    num_buckets: usize,
    table: Vec<u8>,
    victims: HashSet<u32>,
    finished: bool,
}

impl CuckooBlock {
    pub fn new(options: &DirOptions) -> Result<Self, FilterError> {
        let bits = options.filter_bits_per_key;
        if !CUCKOO_WIDTHS.contains(&bits) {
            return Err(FilterError::UnsupportedWidth(bits));
        }
        Ok(Self {
            bits_per_key: bits,
            frac: options.cuckoo_frac,
            max_moves: options.cuckoo_max_moves,
            rng: StdRng::seed_from_u64(options.cuckoo_seed),
            num_buckets: 0,
            table: Vec::new(),
            victims: HashSet::new(),
            finished: true, // pending reset
        })
    }

    pub fn chunk_type(&self) -> ChunkType {
        ChunkType::Cuckoo
    }

    /// Number of fingerprints that could not be placed and were spilled
    /// to the victim set during the current build.
    pub fn num_victims(&self) -> usize {
        self.victims.len()
    }

    pub fn reset(&mut self, num_keys: usize) {
        let wanted =
            ((num_keys + CUCKOO_ITEMS_PER_BUCKET - 1) / CUCKOO_ITEMS_PER_BUCKET) as f64 / self.frac;
        self.num_buckets = (wanted.ceil() as usize).max(1).next_power_of_two();
        let total_bits = self.num_buckets * CUCKOO_ITEMS_PER_BUCKET * self.bits_per_key;
        self.table.clear();
        self.table.resize(total_bits.div_ceil(8), 0);
        self.victims.clear();
        self.finished = false;
    }

    fn fingerprint(&self, key: &[u8]) -> u32 {
        let mask = width_mask(self.bits_per_key);
        let fp = cuckoo_hash(key).wrapping_mul(0x5bd1_e995) & mask;
        if fp == 0 { 1 } else { fp }
    }

    fn slot_read(&self, bucket: usize, item: usize) -> u32 {
        let slot = bucket * CUCKOO_ITEMS_PER_BUCKET + item;
        read_bits(&self.table, slot * self.bits_per_key, self.bits_per_key)
    }

    fn slot_write(&mut self, bucket: usize, item: usize, fp: u32) {
        let slot = bucket * CUCKOO_ITEMS_PER_BUCKET + item;
        let off = slot * self.bits_per_key;
        // Clear then set; eviction overwrites occupied slots.
        for i in 0..self.bits_per_key {
            let pos = off + i;
            self.table[pos / 8] &= !(1 << (pos % 8));
        }
        write_bits(&mut self.table, off, self.bits_per_key, fp);
    }

    pub fn add_key(&mut self, key: &[u8]) {
        debug_assert!(!self.finished);
        let mut fp = self.fingerprint(key);
        let mut bucket = cuckoo_hash(key) as usize % self.num_buckets;

        for round in 0..self.max_moves.max(1) {
            for item in 0..CUCKOO_ITEMS_PER_BUCKET {
                let cur = self.slot_read(bucket, item);
                if cur == fp {
                    return; // already present
                }
                if cur == 0 {
                    self.slot_write(bucket, item, fp);
                    return;
                }
            }
            if round != 0 {
                // Kick out a resident so fp can move in.
                let item = self.rng.gen_range(0..CUCKOO_ITEMS_PER_BUCKET);
                let old = self.slot_read(bucket, item);
                self.slot_write(bucket, item, fp);
                fp = old;
            }
            bucket = cuckoo_alt_bucket(bucket, fp, self.num_buckets);
        }

        self.victims.insert(fp);
        warn!(
            victims = self.victims.len(),
            "cuckoo filter spilled a fingerprint to the victim set"
        );
    }

    pub fn finish(&mut self) -> Vec<u8> {
        debug_assert!(!self.finished);
        self.finished = true;
        let mut out = self.table.clone();
        out.extend_from_slice(&(self.num_buckets as u32).to_le_bytes());
        out.extend_from_slice(&(self.bits_per_key as u32).to_le_bytes());
        out
    }
}

fn width_mask(bits: usize) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

fn cuckoo_alt_bucket(bucket: usize, fp: u32, num_buckets: usize) -> usize {
    // num_buckets is a power of two, so the XOR pairing is involutive.
    (bucket ^ cuckoo_fp_hash(fp) as usize) % num_buckets
}

/// Tests `key` against a serialized cuckoo payload.
///
/// Returns true for any inserted key whose fingerprint was not evicted
/// to the victim set. Malformed payloads are treated as a match.
pub fn cuckoo_key_may_match(key: &[u8], payload: &[u8]) -> bool {
    if payload.len() < CUCKOO_TRAILER_LEN {
        return true;
    }
    let tail = payload.len();
    let num_buckets =
        u32::from_le_bytes(payload[tail - 8..tail - 4].try_into().unwrap()) as usize;
    let bits = u32::from_le_bytes(payload[tail - 4..tail].try_into().unwrap()) as usize;
    if num_buckets == 0 || !CUCKOO_WIDTHS.contains(&bits) {
        return true;
    }
    let table = &payload[..tail - CUCKOO_TRAILER_LEN];

    let mask = width_mask(bits);
    let fp = {
        let raw = cuckoo_hash(key).wrapping_mul(0x5bd1_e995) & mask;
        if raw == 0 { 1 } else { raw }
    };
    let b1 = cuckoo_hash(key) as usize % num_buckets;
    let b2 = cuckoo_alt_bucket(b1, fp, num_buckets);

    for item in 0..CUCKOO_ITEMS_PER_BUCKET {
        let s1 = (b1 * CUCKOO_ITEMS_PER_BUCKET + item) * bits;
        let s2 = (b2 * CUCKOO_ITEMS_PER_BUCKET + item) * bits;
        if read_bits(table, s1, bits) == fp || read_bits(table, s2, bits) == fp {
            return true;
        }
    }
    false
}

// ------------------------------------------------------------------------------------------------
// Builder variant
// ------------------------------------------------------------------------------------------------

/// Tagged filter builder cached across compactions.
///
/// Sized once at logger construction and re-armed per table via
/// [`FilterBuilder::reset`], avoiding a per-table allocation.
pub enum FilterBuilder {
    Bloom(BloomBlock),
    Bitmap(BitmapBlock),
    Cuckoo(CuckooBlock),
}

impl FilterBuilder {
    /// Builds the filter the options select, or `None` when filters are
    /// disabled (explicitly, or via a zero bloom budget).
    pub fn from_options(options: &DirOptions) -> Result<Option<FilterBuilder>, FilterError> {
        match options.filter {
            FilterKind::NoFilter => Ok(None),
            FilterKind::Bloom if options.bf_bits_per_key == 0 => Ok(None),
            FilterKind::Bloom => Ok(Some(FilterBuilder::Bloom(BloomBlock::new(
                options.bf_bits_per_key,
            )))),
            FilterKind::Bitmap => Ok(Some(FilterBuilder::Bitmap(BitmapBlock::new(
                options.bm_key_bits,
                options.bitmap_format,
            )))),
            FilterKind::Cuckoo => Ok(Some(FilterBuilder::Cuckoo(CuckooBlock::new(options)?))),
        }
    }

    pub fn reset(&mut self, num_keys: usize) {
        match self {
            FilterBuilder::Bloom(b) => b.reset(num_keys),
            FilterBuilder::Bitmap(b) => b.reset(num_keys),
            FilterBuilder::Cuckoo(b) => b.reset(num_keys),
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        match self {
            FilterBuilder::Bloom(b) => b.add_key(key),
            FilterBuilder::Bitmap(b) => b.add_key(key),
            FilterBuilder::Cuckoo(b) => b.add_key(key),
        }
    }

    pub fn finish(&mut self) -> Vec<u8> {
        match self {
            FilterBuilder::Bloom(b) => b.finish(),
            FilterBuilder::Bitmap(b) => b.finish(),
            FilterBuilder::Cuckoo(b) => b.finish(),
        }
    }

    pub fn chunk_type(&self) -> ChunkType {
        match self {
            FilterBuilder::Bloom(b) => b.chunk_type(),
            FilterBuilder::Bitmap(b) => b.chunk_type(),
            FilterBuilder::Cuckoo(b) => b.chunk_type(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Dispatcher
// ------------------------------------------------------------------------------------------------

/// Tests a key against a persisted filter payload, dispatching on the
/// chunk-type byte stored in the filter block trailer.
///
/// Unknown tags (outer or bitmap-internal) degrade to "may match" so a
/// newer filter encoding never hides data from an older reader; with
/// `paranoid_checks` they surface as [`FilterError::NotSupported`].
pub fn filter_may_match(
    key: &[u8],
    payload: &[u8],
    chunk_type: u8,
    paranoid_checks: bool,
) -> Result<bool, FilterError> {
    match ChunkType::from_u8(chunk_type) {
        Some(ChunkType::Bloom) => Ok(bloom_key_may_match(key, payload)),
        Some(ChunkType::Bitmap) => match bitmap_key_may_match(key, payload) {
            Ok(matched) => Ok(matched),
            Err(e) if paranoid_checks => Err(e),
            Err(_) => Ok(true),
        },
        Some(ChunkType::Cuckoo) => Ok(cuckoo_key_may_match(key, payload)),
        _ if paranoid_checks => Err(FilterError::NotSupported(chunk_type)),
        _ => Ok(true),
    }
}
