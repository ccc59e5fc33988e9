//! Filter dispatcher tests — tag routing and paranoid behavior.

#[cfg(test)]
mod tests {
    use crate::filter::{filter_may_match, BloomBlock, FilterBuilder, FilterError};
    use crate::format::ChunkType;
    use crate::options::{BitmapFormat, DirOptions, FilterKind};

    #[test]
    fn test_bloom_routing() {
        let mut bloom = BloomBlock::new(10);
        bloom.reset(4);
        bloom.add_key(b"present");
        let payload = bloom.finish();
        assert!(filter_may_match(b"present", &payload, ChunkType::Bloom as u8, true).unwrap());
    }

    #[test]
    fn test_unknown_tag_degrades_to_match() {
        // Backward compatibility: an unreadable filter must not hide
        // data when paranoid checks are off.
        assert!(filter_may_match(b"key", b"whatever", 0x09, false).unwrap());
        assert!(filter_may_match(b"key", b"", 0xff, false).unwrap());
    }

    #[test]
    fn test_unknown_tag_paranoid_errors() {
        assert!(matches!(
            filter_may_match(b"key", b"whatever", 0x09, true),
            Err(FilterError::NotSupported(0x09))
        ));
    }

    #[test]
    fn test_raw_tag_is_not_a_filter() {
        // Data-block tags reaching the filter dispatcher are unknown.
        assert!(filter_may_match(b"key", b"payload", ChunkType::Raw as u8, false).unwrap());
        assert!(matches!(
            filter_may_match(b"key", b"payload", ChunkType::Raw as u8, true),
            Err(FilterError::NotSupported(0))
        ));
    }

    #[test]
    fn test_bitmap_inner_tag_paranoid() {
        let mut bitmap_options = DirOptions {
            filter: FilterKind::Bitmap,
            bitmap_format: BitmapFormat::Varint,
            bm_key_bits: 12,
            ..DirOptions::default()
        };
        bitmap_options.bf_bits_per_key = 0;
        let mut builder = FilterBuilder::from_options(&bitmap_options).unwrap().unwrap();
        builder.reset(1);
        builder.add_key(&5u32.to_le_bytes());
        let mut payload = builder.finish();

        // Damage the inner bitmap format tag.
        let last = payload.len() - 1;
        payload[last] = 0x60;
        let tag = ChunkType::Bitmap as u8;
        assert!(filter_may_match(&5u32.to_le_bytes(), &payload, tag, false).unwrap());
        assert!(matches!(
            filter_may_match(&5u32.to_le_bytes(), &payload, tag, true),
            Err(FilterError::NotSupported(0x60))
        ));
    }

    #[test]
    fn test_builder_selection() {
        let bloom = DirOptions::default();
        assert!(matches!(
            FilterBuilder::from_options(&bloom).unwrap(),
            Some(FilterBuilder::Bloom(_))
        ));

        let disabled = DirOptions {
            filter: FilterKind::NoFilter,
            ..DirOptions::default()
        };
        assert!(FilterBuilder::from_options(&disabled).unwrap().is_none());

        // A zero bloom budget disables the filter too.
        let zero = DirOptions {
            bf_bits_per_key: 0,
            ..DirOptions::default()
        };
        assert!(FilterBuilder::from_options(&zero).unwrap().is_none());

        let cuckoo = DirOptions {
            filter: FilterKind::Cuckoo,
            filter_bits_per_key: 24,
            ..DirOptions::default()
        };
        assert!(matches!(
            FilterBuilder::from_options(&cuckoo).unwrap(),
            Some(FilterBuilder::Cuckoo(_))
        ));
    }

    #[test]
    fn test_builder_chunk_types() {
        let bitmap = DirOptions {
            filter: FilterKind::Bitmap,
            ..DirOptions::default()
        };
        let builder = FilterBuilder::from_options(&bitmap).unwrap().unwrap();
        assert_eq!(builder.chunk_type(), ChunkType::Bitmap);
    }
}
