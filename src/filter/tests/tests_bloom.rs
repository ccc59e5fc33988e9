//! Bloom filter tests.

#[cfg(test)]
mod tests {
    use crate::filter::{bloom_key_may_match, BloomBlock};

    fn keys(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("file.{i:08}").into_bytes()).collect()
    }

    #[test]
    fn test_no_false_negatives() {
        let keys = keys(1000);
        let mut bloom = BloomBlock::new(10);
        bloom.reset(keys.len());
        for key in &keys {
            bloom.add_key(key);
        }
        let payload = bloom.finish();
        for key in &keys {
            assert!(
                bloom_key_may_match(key, &payload),
                "false negative for {:?}",
                String::from_utf8_lossy(key)
            );
        }
    }

    #[test]
    fn test_false_positive_rate_reasonable() {
        let present = keys(4096);
        let mut bloom = BloomBlock::new(10);
        bloom.reset(present.len());
        for key in &present {
            bloom.add_key(key);
        }
        let payload = bloom.finish();

        let mut false_positives = 0usize;
        let probes = 4096usize;
        for i in 0..probes {
            let key = format!("absent.{i:08}");
            if bloom_key_may_match(key.as_bytes(), &payload) {
                false_positives += 1;
            }
        }
        // 10 bits per key targets ~1%; allow generous slack.
        assert!(
            false_positives < probes / 20,
            "false positive rate too high: {false_positives}/{probes}"
        );
    }

    #[test]
    fn test_minimum_length_for_tiny_sets() {
        let mut bloom = BloomBlock::new(8);
        bloom.reset(1);
        bloom.add_key(b"only");
        let payload = bloom.finish();
        // At least 64 bits of array plus the probe-count byte.
        assert!(payload.len() >= 9);
        assert!(bloom_key_may_match(b"only", &payload));
    }

    #[test]
    fn test_probe_count_stored_in_last_byte() {
        let mut bloom = BloomBlock::new(10);
        bloom.reset(100);
        bloom.add_key(b"k");
        let payload = bloom.finish();
        let k = payload[payload.len() - 1];
        assert!(k >= 1 && k <= 30);
    }

    #[test]
    fn test_short_payload_matches() {
        assert!(bloom_key_may_match(b"anything", &[]));
        assert!(bloom_key_may_match(b"anything", &[0x07]));
    }

    #[test]
    fn test_reserved_probe_count_matches() {
        // k above 30 is reserved for future encodings; must not reject.
        let payload = vec![0x00, 0x00, 0x00, 31];
        assert!(bloom_key_may_match(b"anything", &payload));
    }

    #[test]
    fn test_reset_rearms_builder() {
        let mut bloom = BloomBlock::new(10);
        bloom.reset(10);
        bloom.add_key(b"first");
        let first = bloom.finish();
        assert!(bloom_key_may_match(b"first", &first));

        bloom.reset(10);
        bloom.add_key(b"second");
        let second = bloom.finish();
        assert!(bloom_key_may_match(b"second", &second));
    }
}
