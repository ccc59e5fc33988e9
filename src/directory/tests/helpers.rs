//! Shared harness for directory round-trip tests: an in-memory
//! partition with a write-then-read lifecycle mirroring how the store
//! is used in production (write burst, epoch flush, finish, read).

use std::sync::Arc;

use crate::directory::DirWriter;
use crate::log::MemFs;
use crate::options::DirOptions;
use crate::reader::DirReader;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Small-buffer options over a fresh in-memory filesystem, with full
/// read-side verification switched on.
pub fn test_options() -> DirOptions {
    DirOptions {
        total_memtable_budget: 1 << 20,
        block_size: 64 << 10,
        block_util: 0.998,
        verify_checksums: true,
        paranoid_checks: true,
        fs: Arc::new(MemFs::new()),
        ..DirOptions::default()
    }
}

/// One directory partition driven through write → finish → read.
pub struct TestDir {
    pub options: DirOptions,
    pub writer: Option<DirWriter>,
    pub reader: Option<DirReader>,
}

impl TestDir {
    pub fn new(options: DirOptions) -> Self {
        init_tracing();
        Self {
            options,
            writer: None,
            reader: None,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(test_options())
    }

    fn writer(&mut self) -> &DirWriter {
        if self.writer.is_none() {
            self.writer =
                Some(DirWriter::open(self.options.clone(), "part").expect("open writer"));
        }
        self.writer.as_ref().unwrap()
    }

    pub fn write(&mut self, key: &[u8], value: &[u8]) {
        self.writer().add(key, value).expect("add");
    }

    pub fn make_epoch(&mut self) {
        self.writer().epoch_flush().expect("epoch flush");
    }

    pub fn finish(&mut self) {
        self.writer().finish().expect("finish");
        self.writer = None;
    }

    /// Finishes the writer (first call) and resolves a key.
    pub fn read(&mut self, key: &[u8]) -> Vec<u8> {
        if self.writer.is_some() {
            self.finish();
        }
        if self.reader.is_none() {
            self.reader =
                Some(DirReader::open(self.options.clone(), "part").expect("open reader"));
        }
        self.reader.as_ref().unwrap().read_all(key).expect("read")
    }
}
