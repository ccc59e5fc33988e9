//! Wire-format primitive tests.

#[cfg(test)]
mod tests {
    use crate::format::{
        decode_length_prefixed, decode_varint64, encode_length_prefixed, encode_varint64,
        BlockHandle, ChunkType, Footer, FormatError, TableHandle, FOOTER_LEN, FOOTER_MAGIC,
    };

    #[test]
    fn test_varint_roundtrip() {
        for value in [
            0u64,
            1,
            127,
            128,
            300,
            16_383,
            16_384,
            u32::MAX as u64,
            u64::MAX,
        ] {
            let mut buf = Vec::new();
            encode_varint64(&mut buf, value);
            let (decoded, used) = decode_varint64(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_varint_single_byte_boundary() {
        let mut buf = Vec::new();
        encode_varint64(&mut buf, 127);
        assert_eq!(buf.len(), 1);
        buf.clear();
        encode_varint64(&mut buf, 128);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_varint_truncated() {
        // Continuation bit set with nothing following.
        let buf = [0x80u8];
        assert!(matches!(
            decode_varint64(&buf),
            Err(FormatError::BadVarint)
        ));
    }

    #[test]
    fn test_length_prefixed_roundtrip() {
        let mut buf = Vec::new();
        encode_length_prefixed(&mut buf, b"hello");
        encode_length_prefixed(&mut buf, b"");
        let (first, n) = decode_length_prefixed(&buf).unwrap();
        assert_eq!(first, b"hello");
        let (second, _) = decode_length_prefixed(&buf[n..]).unwrap();
        assert_eq!(second, b"");
    }

    #[test]
    fn test_block_handle_roundtrip() {
        let handle = BlockHandle::new(1_234_567, 89_012);
        let mut buf = Vec::new();
        handle.encode_to(&mut buf);
        let (decoded, used) = BlockHandle::decode_from(&buf).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_null_handle() {
        assert!(BlockHandle::NULL.is_null());
        assert!(!BlockHandle::new(0, 10).is_null());
    }

    #[test]
    fn test_table_handle_roundtrip() {
        let handle = TableHandle {
            smallest_key: b"aardvark".to_vec(),
            largest_key: b"zebra".to_vec(),
            index_handle: BlockHandle::new(4096, 512),
            filter_handle: BlockHandle::NULL,
        };
        let encoded = handle.encode();
        let decoded = TableHandle::decode(&encoded).unwrap();
        assert_eq!(decoded, handle);
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            root_handle: BlockHandle::new(7_000_000, 321),
            mode: 2,
            filter_kind: 1,
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), FOOTER_LEN);
        let decoded = Footer::decode(&encoded).unwrap();
        assert_eq!(decoded, footer);
    }

    #[test]
    fn test_footer_magic_position() {
        let footer = Footer {
            root_handle: BlockHandle::new(0, 0),
            mode: 0,
            filter_kind: 0,
        };
        let encoded = footer.encode();
        let magic = u64::from_le_bytes(encoded[FOOTER_LEN - 8..].try_into().unwrap());
        assert_eq!(magic, FOOTER_MAGIC);
    }

    #[test]
    fn test_footer_bad_magic() {
        let footer = Footer {
            root_handle: BlockHandle::new(10, 20),
            mode: 0,
            filter_kind: 0,
        };
        let mut encoded = footer.encode();
        encoded[FOOTER_LEN - 1] ^= 0xff;
        assert!(matches!(
            Footer::decode(&encoded),
            Err(FormatError::BadMagic(_))
        ));
    }

    #[test]
    fn test_footer_truncated() {
        assert!(matches!(
            Footer::decode(&[0u8; FOOTER_LEN - 1]),
            Err(FormatError::Truncated)
        ));
    }

    #[test]
    fn test_chunk_type_tags() {
        assert_eq!(ChunkType::from_u8(0), Some(ChunkType::Raw));
        assert_eq!(ChunkType::from_u8(1), Some(ChunkType::Snappy));
        assert_eq!(ChunkType::from_u8(2), Some(ChunkType::Bloom));
        assert_eq!(ChunkType::from_u8(3), Some(ChunkType::Bitmap));
        assert_eq!(ChunkType::from_u8(4), Some(ChunkType::Cuckoo));
        assert_eq!(ChunkType::from_u8(5), None);
        assert!(ChunkType::Bloom.is_filter());
        assert!(!ChunkType::Raw.is_filter());
    }
}
