//! Background compaction and non-blocking write tests.

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::directory::tests::helpers::{test_options, TestDir};
    use crate::directory::DirError;
    use crate::options::DirOptions;
    use crate::pool::{FixedThreadPool, ThreadPool};

    #[test]
    fn test_background_pool_compaction() {
        let pool: Arc<dyn ThreadPool> = Arc::new(FixedThreadPool::new(2));
        let mut dir = TestDir::new(DirOptions {
            compaction_pool: Some(pool),
            ..test_options()
        });
        for epoch in 0..3 {
            for i in 0..1000 {
                let key = format!("k{i:06}");
                let value = format!("e{epoch}");
                dir.write(key.as_bytes(), value.as_bytes());
            }
            dir.make_epoch();
        }
        assert_eq!(dir.read(b"k000123"), b"e0e1e2");
        assert_eq!(dir.read(b"missing"), b"");
    }

    #[test]
    fn test_pool_compaction_with_small_buffers() {
        // A tiny budget forces many buffer swaps through the pool.
        let pool: Arc<dyn ThreadPool> = Arc::new(FixedThreadPool::new(1));
        let mut dir = TestDir::new(DirOptions {
            total_memtable_budget: 16 << 10,
            compaction_pool: Some(pool),
            ..test_options()
        });
        for i in 0..4096 {
            let key = format!("k{i:06}");
            dir.write(key.as_bytes(), &[b'v'; 32]);
        }
        dir.make_epoch();
        assert_eq!(dir.read(b"k000000"), vec![b'v'; 32]);
        assert_eq!(dir.read(b"k004095"), vec![b'v'; 32]);
    }

    #[test]
    fn test_parallel_reader_matches_sequential() {
        let mut dir = TestDir::with_defaults();
        for epoch in 0..4 {
            dir.write(b"k1", format!("a{epoch}").as_bytes());
            dir.write(b"k2", format!("b{epoch}").as_bytes());
            dir.make_epoch();
        }
        dir.finish();

        let sequential =
            crate::reader::DirReader::open(dir.options.clone(), "part").expect("open");
        let pool: Arc<dyn ThreadPool> = Arc::new(FixedThreadPool::new(3));
        let parallel = crate::reader::DirReader::open(
            DirOptions {
                reader_pool: Some(pool),
                ..dir.options.clone()
            },
            "part",
        )
        .expect("open");

        for key in [b"k1".as_slice(), b"k2", b"nope"] {
            assert_eq!(
                sequential.read_all(key).unwrap(),
                parallel.read_all(key).unwrap()
            );
        }
        assert_eq!(parallel.read_all(b"k1").unwrap(), b"a0a1a2a3");
    }

    /// A pool that queues jobs until the test releases them, making
    /// "compaction still in flight" states deterministic.
    #[derive(Default)]
    struct ManualPool {
        jobs: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl ManualPool {
        fn run_all(&self) {
            let jobs: Vec<_> = std::mem::take(&mut *self.jobs.lock().unwrap());
            for job in jobs {
                job();
            }
        }
    }

    impl ThreadPool for ManualPool {
        fn execute(&self, job: Box<dyn FnOnce() + Send>) {
            self.jobs.lock().unwrap().push(job);
        }
    }

    #[test]
    fn test_non_blocking_add_returns_busy() {
        let pool = Arc::new(ManualPool::default());
        // Roughly 12 entries of (8 key + 32 value) per buffer.
        let options = DirOptions {
            total_memtable_budget: 2 << 10,
            non_blocking: true,
            compaction_pool: Some(Arc::clone(&pool) as Arc<dyn ThreadPool>),
            ..test_options()
        };
        let writer = crate::directory::DirWriter::open(options, "part").expect("open");

        let value = [b'v'; 32];
        let mut accepted = 0usize;
        let mut saw_busy = false;
        for i in 0..256 {
            let key = format!("k{i:06}");
            match writer.add(key.as_bytes(), &value) {
                Ok(()) => accepted += 1,
                Err(DirError::Busy) => {
                    saw_busy = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_busy, "writer never reported busy");
        assert!(accepted > 0);

        // Draining the pending compaction unblocks the writer.
        pool.run_all();
        writer.add(b"late-key", &value).expect("add after drain");
    }
}
