//! Table logger tests against an in-memory filesystem.

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use crate::format::{Footer, FOOTER_LEN};
    use crate::log::{Fs, LogSink, MemFs};
    use crate::options::DirOptions;
    use crate::table::{TableError, TableLogger};

    fn options(fs: &Arc<MemFs>) -> DirOptions {
        DirOptions {
            fs: Arc::clone(fs) as Arc<dyn crate::log::Fs>,
            block_size: 256,
            ..DirOptions::default()
        }
    }

    fn logger(fs: &Arc<MemFs>) -> TableLogger {
        let options = options(fs);
        let data = LogSink::new(fs.create(Path::new("0.dat")).unwrap(), 1 << 20, 1 << 10);
        let indx = LogSink::new(fs.create(Path::new("0.idx")).unwrap(), 1 << 20, 1 << 10);
        TableLogger::new(options, data, indx)
    }

    #[test]
    fn test_single_table_single_epoch() {
        let fs = Arc::new(MemFs::new());
        let mut tb = logger(&fs);
        tb.add(b"k1", b"v1").unwrap();
        tb.add(b"k2", b"v2").unwrap();
        tb.end_table(None).unwrap();
        tb.make_epoch().unwrap();
        tb.finish().unwrap();

        let stats = tb.output_stats();
        assert_eq!(stats.num_tables, 1);
        assert_eq!(stats.key_bytes, 4);
        assert_eq!(stats.value_bytes, 4);
        assert!(stats.num_data_blocks >= 1);
        assert_eq!(tb.num_epochs(), 1);
        assert!(fs.file_size(Path::new("0.dat")).unwrap() > 0);
    }

    #[test]
    fn test_footer_terminates_index_log() {
        let fs = Arc::new(MemFs::new());
        let mut tb = logger(&fs);
        tb.add(b"a", b"1").unwrap();
        tb.end_table(None).unwrap();
        tb.make_epoch().unwrap();
        tb.finish().unwrap();

        let source = fs.open(Path::new("0.idx")).unwrap();
        let len = source.len();
        assert!(len >= FOOTER_LEN as u64);
        let tail = source.read_at(len - FOOTER_LEN as u64, FOOTER_LEN).unwrap();
        let footer = Footer::decode(&tail).unwrap();
        assert!(!footer.root_handle.is_null());
    }

    #[test]
    fn test_out_of_order_key_rejected_and_latched() {
        let fs = Arc::new(MemFs::new());
        let mut tb = logger(&fs);
        tb.add(b"k5", b"v").unwrap();
        let err = tb.add(b"k1", b"v").unwrap_err();
        assert!(matches!(err, TableError::InvalidArgument(_)));

        // Everything afterwards returns the captured status.
        assert!(matches!(
            tb.add(b"k9", b"v").unwrap_err(),
            TableError::Latched(_)
        ));
        assert!(matches!(tb.commit().unwrap_err(), TableError::Latched(_)));
        assert!(matches!(tb.finish().unwrap_err(), TableError::Latched(_)));
    }

    #[test]
    fn test_equal_keys_allowed() {
        let fs = Arc::new(MemFs::new());
        let mut tb = logger(&fs);
        tb.add(b"dup", b"v1").unwrap();
        tb.add(b"dup", b"v2").unwrap();
        tb.end_table(None).unwrap();
        tb.make_epoch().unwrap();
        tb.finish().unwrap();
        assert_eq!(tb.output_stats().num_tables, 1);
    }

    #[test]
    fn test_empty_table_is_skipped() {
        let fs = Arc::new(MemFs::new());
        let mut tb = logger(&fs);
        tb.end_table(None).unwrap();
        tb.make_epoch().unwrap();
        tb.finish().unwrap();
        assert_eq!(tb.output_stats().num_tables, 0);
        assert_eq!(tb.num_epochs(), 1);
    }

    #[test]
    fn test_new_table_may_restart_key_range() {
        let fs = Arc::new(MemFs::new());
        let mut tb = logger(&fs);
        tb.add(b"m", b"1").unwrap();
        tb.add(b"z", b"2").unwrap();
        tb.end_table(None).unwrap();
        // A fresh table in the same epoch may begin below the previous
        // table's largest key.
        tb.add(b"a", b"3").unwrap();
        tb.end_table(None).unwrap();
        tb.make_epoch().unwrap();
        tb.finish().unwrap();
        assert_eq!(tb.output_stats().num_tables, 2);
        assert_eq!(tb.num_tables_in_epoch(), 0);
    }

    #[test]
    fn test_small_blocks_split() {
        let fs = Arc::new(MemFs::new());
        let mut tb = logger(&fs); // block_size = 256
        for i in 0..64 {
            let key = format!("key{i:04}");
            tb.add(key.as_bytes(), &[0x61; 32]).unwrap();
        }
        tb.end_table(None).unwrap();
        tb.make_epoch().unwrap();
        tb.finish().unwrap();
        assert!(tb.output_stats().num_data_blocks > 1);
    }

    #[test]
    fn test_operations_after_finish_rejected() {
        let fs = Arc::new(MemFs::new());
        let mut tb = logger(&fs);
        tb.add(b"k", b"v").unwrap();
        tb.end_table(None).unwrap();
        tb.make_epoch().unwrap();
        tb.finish().unwrap();
        assert!(matches!(
            tb.add(b"z", b"v").unwrap_err(),
            TableError::InvalidArgument(_)
        ));
    }

    #[test]
    fn test_multiple_epochs_count() {
        let fs = Arc::new(MemFs::new());
        let mut tb = logger(&fs);
        for epoch in 0..3 {
            let key = format!("k{epoch}");
            tb.add(key.as_bytes(), b"v").unwrap();
            tb.end_table(None).unwrap();
            tb.make_epoch().unwrap();
        }
        tb.finish().unwrap();
        assert_eq!(tb.num_epochs(), 3);
        assert_eq!(tb.output_stats().num_tables, 3);
    }
}
