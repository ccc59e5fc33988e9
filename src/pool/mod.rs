//! # Thread Pool
//!
//! The fixed-size worker pool the directory machinery runs its
//! background work on: memtable compactions on the write side and
//! per-epoch fan-out on the read side. The pool is an injected
//! collaborator — anything implementing [`ThreadPool`] will do —
//! and [`FixedThreadPool`] is the bundled implementation.
//!
//! Jobs are opaque closures; the pool makes no ordering promises beyond
//! running every submitted job exactly once. Directory-level
//! serialization (one compaction in flight per partition) is enforced
//! by the callers, not here.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, trace};

// ------------------------------------------------------------------------------------------------
// Trait
// ------------------------------------------------------------------------------------------------

/// A sink for background jobs.
pub trait ThreadPool: Send + Sync {
    /// Enqueues a job. The pool runs it on some worker thread at some
    /// later point; there is no completion signal beyond whatever the
    /// job itself arranges.
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

// ------------------------------------------------------------------------------------------------
// Fixed pool
// ------------------------------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send>;

/// A fixed-size pool of named OS threads fed from one queue.
///
/// Dropping the pool closes the queue and joins every worker; jobs
/// already queued still run to completion.
pub struct FixedThreadPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl FixedThreadPool {
    /// Spawns `num_threads` workers (at least one).
    pub fn new(num_threads: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(num_threads.max(1));
        for id in 0..num_threads.max(1) {
            let receiver = Arc::clone(&receiver);
            let handle = std::thread::Builder::new()
                .name(format!("epochlog-bg-{id}"))
                .spawn(move || loop {
                    let job = {
                        let guard = match receiver.lock() {
                            Ok(guard) => guard,
                            Err(_) => break,
                        };
                        guard.recv()
                    };
                    match job {
                        Ok(job) => {
                            trace!(worker = id, "running background job");
                            job();
                        }
                        // Queue closed, pool is shutting down.
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }

        debug!(num_threads = workers.len(), "thread pool started");
        Self {
            sender: Some(sender),
            workers,
        }
    }
}

impl ThreadPool for FixedThreadPool {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) {
        if let Some(sender) = &self.sender {
            // A send error means the workers are gone; the job is
            // dropped, which only happens during teardown.
            let _ = sender.send(job);
        }
    }
}

impl Drop for FixedThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("thread pool stopped");
    }
}
