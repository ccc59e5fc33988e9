//! Corruption detection tests for sealed blocks.

#[cfg(test)]
mod tests {
    use crate::block::{seal_block, unseal_block, Block, BlockBuilder, BlockError};
    use crate::options::Compression;

    fn sealed_sample() -> Vec<u8> {
        let mut builder = BlockBuilder::new(16);
        builder.add(b"k1", b"v1");
        builder.add(b"k2", b"v2");
        seal_block(&builder.finish(), Compression::NoCompression, false).unwrap()
    }

    #[test]
    fn test_bit_flip_detected() {
        let sealed = sealed_sample();
        for i in 0..sealed.len() - 4 {
            let mut damaged = sealed.clone();
            damaged[i] ^= 0x01;
            let result = unseal_block(&damaged, true);
            assert!(
                matches!(result, Err(BlockError::ChecksumMismatch)),
                "flip at byte {i} went undetected"
            );
        }
    }

    #[test]
    fn test_crc_flip_detected() {
        let mut sealed = sealed_sample();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x80;
        assert!(matches!(
            unseal_block(&sealed, true),
            Err(BlockError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_verification_off_accepts_damage() {
        let mut sealed = sealed_sample();
        sealed[0] ^= 0x01;
        // Without checksum verification the damage slips through the
        // trailer; the payload is simply wrong.
        assert!(unseal_block(&sealed, false).is_ok());
    }

    #[test]
    fn test_shorter_than_trailer() {
        for len in 0..5 {
            let bytes = vec![0u8; len];
            assert!(matches!(
                unseal_block(&bytes, true),
                Err(BlockError::Corruption(_))
            ));
        }
    }

    #[test]
    fn test_bad_restart_count() {
        // Payload whose restart count points past the payload itself.
        let mut payload = vec![0u8; 8];
        payload[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Block::new(payload),
            Err(BlockError::Corruption(_))
        ));
    }

    #[test]
    fn test_payload_too_small_for_block() {
        assert!(matches!(
            Block::new(vec![0u8; 2]),
            Err(BlockError::Corruption(_))
        ));
    }
}
