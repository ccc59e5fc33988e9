//! Bitmap filter tests — exactness across all six encodings.

#[cfg(test)]
mod tests {
    use crate::filter::{bitmap_key_may_match, BitmapBlock, FilterError};
    use crate::options::BitmapFormat;

    const FORMATS: [BitmapFormat; 6] = [
        BitmapFormat::Uncompressed,
        BitmapFormat::Varint,
        BitmapFormat::VarintPlus,
        BitmapFormat::PForDelta,
        BitmapFormat::Roaring,
        BitmapFormat::PartitionedRoaring,
    ];

    fn key_of(index: u32) -> [u8; 4] {
        index.to_le_bytes()
    }

    fn build(format: BitmapFormat, key_bits: usize, indices: &[u32]) -> Vec<u8> {
        let mut bitmap = BitmapBlock::new(key_bits, format);
        bitmap.reset(indices.len());
        for &i in indices {
            bitmap.add_key(&key_of(i));
        }
        bitmap.finish()
    }

    /// Deterministic pseudo-random subset of the domain.
    fn sample_indices(key_bits: usize, count: usize) -> Vec<u32> {
        let domain = 1u64 << key_bits;
        (0..count as u64)
            .map(|i| ((i.wrapping_mul(2_654_435_761) ^ (i << 7)) % domain) as u32)
            .collect()
    }

    #[test]
    fn test_exact_membership_all_formats() {
        let key_bits = 16;
        let inserted = sample_indices(key_bits, 700);
        for format in FORMATS {
            let payload = build(format, key_bits, &inserted);
            for &i in &inserted {
                assert!(
                    bitmap_key_may_match(&key_of(i), &payload).unwrap(),
                    "{format:?}: missing inserted index {i}"
                );
            }
            // Within-domain indices that were not inserted must miss.
            let inserted_set: std::collections::HashSet<u32> =
                inserted.iter().copied().collect();
            for i in 0..(1u32 << key_bits) {
                if inserted_set.contains(&i) {
                    continue;
                }
                assert!(
                    !bitmap_key_may_match(&key_of(i), &payload).unwrap(),
                    "{format:?}: false positive at index {i}"
                );
            }
        }
    }

    #[test]
    fn test_dense_and_sparse_extremes() {
        let key_bits = 10;
        let full: Vec<u32> = (0..1u32 << key_bits).collect();
        let lone = vec![513u32];
        for format in FORMATS {
            let payload = build(format, key_bits, &full);
            for i in 0..1u32 << key_bits {
                assert!(bitmap_key_may_match(&key_of(i), &payload).unwrap());
            }
            let payload = build(format, key_bits, &lone);
            assert!(bitmap_key_may_match(&key_of(513), &payload).unwrap());
            assert!(!bitmap_key_may_match(&key_of(512), &payload).unwrap());
        }
    }

    #[test]
    fn test_empty_filter_rejects_domain() {
        for format in FORMATS {
            let payload = build(format, 12, &[]);
            for i in [0u32, 1, 100, 4095] {
                assert!(
                    !bitmap_key_may_match(&key_of(i), &payload).unwrap(),
                    "{format:?}: empty filter matched index {i}"
                );
            }
        }
    }

    #[test]
    fn test_index_zero_and_max() {
        let key_bits = 14;
        let edge = vec![0u32, (1 << key_bits) - 1];
        for format in FORMATS {
            let payload = build(format, key_bits, &edge);
            assert!(bitmap_key_may_match(&key_of(0), &payload).unwrap());
            assert!(bitmap_key_may_match(&key_of((1 << key_bits) - 1), &payload).unwrap());
            assert!(!bitmap_key_may_match(&key_of(1), &payload).unwrap());
        }
    }

    #[test]
    fn test_duplicate_inserts_are_idempotent() {
        for format in FORMATS {
            let payload = build(format, 12, &[7, 7, 7, 9, 9]);
            assert!(bitmap_key_may_match(&key_of(7), &payload).unwrap());
            assert!(bitmap_key_may_match(&key_of(9), &payload).unwrap());
            assert!(!bitmap_key_may_match(&key_of(8), &payload).unwrap());
        }
    }

    #[test]
    fn test_long_keys_use_first_four_bytes() {
        let mut bitmap = BitmapBlock::new(16, BitmapFormat::Varint);
        bitmap.reset(1);
        bitmap.add_key(b"\x2a\x00\x00\x00trailing-bytes-ignored");
        let payload = bitmap.finish();
        assert!(bitmap_key_may_match(&key_of(42), &payload).unwrap());
    }

    #[test]
    fn test_short_keys_zero_padded() {
        let mut bitmap = BitmapBlock::new(16, BitmapFormat::Uncompressed);
        bitmap.reset(1);
        bitmap.add_key(b"\x05"); // one byte, padded to index 5
        let payload = bitmap.finish();
        assert!(bitmap_key_may_match(&key_of(5), &payload).unwrap());
        assert!(!bitmap_key_may_match(&key_of(5 | 0x100), &payload).unwrap());
    }

    #[test]
    fn test_varint_plus_escape_path() {
        // Gaps larger than 254 exercise the 0xFF escape.
        let indices = vec![0u32, 300, 10_000, 10_001];
        let payload = build(BitmapFormat::VarintPlus, 16, &indices);
        for &i in &indices {
            assert!(bitmap_key_may_match(&key_of(i), &payload).unwrap());
        }
        assert!(!bitmap_key_may_match(&key_of(299), &payload).unwrap());
        assert!(!bitmap_key_may_match(&key_of(301), &payload).unwrap());
    }

    #[test]
    fn test_pfor_delta_multiple_cohorts() {
        // More than 128 indices forces several cohorts, the last short.
        let indices: Vec<u32> = (0..300).map(|i| i * 3).collect();
        let payload = build(BitmapFormat::PForDelta, 12, &indices);
        for &i in &indices {
            assert!(bitmap_key_may_match(&key_of(i), &payload).unwrap());
        }
        assert!(!bitmap_key_may_match(&key_of(1), &payload).unwrap());
    }

    #[test]
    fn test_trailing_bytes_identify_format() {
        let payload = build(BitmapFormat::Roaring, 16, &[1, 2, 3]);
        assert_eq!(payload[payload.len() - 2], 16); // domain bits
        assert_eq!(payload[payload.len() - 1], 4); // roaring tag
    }

    #[test]
    fn test_unknown_format_tag_is_not_supported() {
        let mut payload = build(BitmapFormat::Varint, 12, &[1]);
        let last = payload.len() - 1;
        payload[last] = 0x77;
        assert!(matches!(
            bitmap_key_may_match(&key_of(1), &payload),
            Err(FilterError::NotSupported(0x77))
        ));
    }
}
