//! Background worker pool for tile generation.
//!
//! The pool is an explicit resource: the caller creates it and hands it to
//! whatever needs background work. Jobs are fire-and-forget closures; callers
//! observe completion through their own handoff (the streamer pushes finished
//! meshes into its upload queue).
//!
//! An inline pool runs every job on the submitting thread, which keeps tests
//! and tools deterministic.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool no longer accepts jobs
    #[error("Worker pool is shut down")]
    ShutDown,
}

/// Tracks jobs that were submitted but have not finished.
#[derive(Debug, Default)]
struct JobTracker {
    in_flight: Mutex<usize>,
    idle: Condvar,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl JobTracker {
    fn begin(&self) {
        *self.in_flight.lock() += 1;
    }

    fn finish(&self, panicked: bool) {
        if panicked {
            self.panicked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completed.fetch_add(1, Ordering::Relaxed);
        }
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    fn run(&self, job: Job) {
        let panicked = panic::catch_unwind(AssertUnwindSafe(job)).is_err();
        if panicked {
            warn!("Worker job panicked");
        }
        self.finish(panicked);
    }
}

/// Fixed-size pool of generation workers.
pub struct WorkerPool {
    /// Job queue, `None` once shut down or for inline pools
    sender: Option<Sender<Job>>,
    /// Worker thread handles
    workers: Vec<JoinHandle<()>>,
    /// Shared in-flight bookkeeping
    tracker: Arc<JobTracker>,
    /// Whether jobs run on the submitting thread
    inline: bool,
}

impl WorkerPool {
    /// Creates a pool with `threads` workers (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let tracker = Arc::new(JobTracker::default());

        let workers = (0..threads)
            .filter_map(|index| {
                let receiver = receiver.clone();
                let tracker = Arc::clone(&tracker);
                thread::Builder::new()
                    .name(format!("horizon-gen-{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            tracker.run(job);
                        }
                    })
                    .map_err(|e| warn!("Failed to spawn worker {index}: {e}"))
                    .ok()
            })
            .collect::<Vec<_>>();

        debug!("Worker pool started with {} threads", workers.len());

        if workers.is_empty() {
            warn!("No worker threads could be spawned, running jobs inline");
            return Self::inline();
        }

        Self {
            sender: Some(sender),
            workers,
            tracker,
            inline: false,
        }
    }

    /// Creates a pool sized to half the available hardware threads.
    #[must_use]
    pub fn with_default_size() -> Self {
        Self::new(Self::default_size())
    }

    /// Half the available hardware threads, at least one.
    #[must_use]
    pub fn default_size() -> usize {
        thread::available_parallelism()
            .map(|n| n.get() / 2)
            .unwrap_or(1)
            .max(1)
    }

    /// Creates a pool that runs every job immediately on the caller's thread.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            sender: None,
            workers: Vec::new(),
            tracker: Arc::new(JobTracker::default()),
            inline: true,
        }
    }

    /// Whether jobs run on the submitting thread.
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        self.inline
    }

    /// Number of worker threads (zero for inline pools).
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Submits a job.
    ///
    /// Inline pools run the job before returning.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inline {
            self.tracker.begin();
            self.tracker.run(Box::new(job));
            return Ok(());
        }

        let sender = self.sender.as_ref().ok_or(PoolError::ShutDown)?;
        self.tracker.begin();
        if sender.send(Box::new(job)).is_err() {
            self.tracker.finish(false);
            return Err(PoolError::ShutDown);
        }
        Ok(())
    }

    /// Jobs submitted but not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.tracker.in_flight.lock()
    }

    /// Jobs that finished normally.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.tracker.completed.load(Ordering::Relaxed)
    }

    /// Jobs that panicked.
    #[must_use]
    pub fn panicked(&self) -> u64 {
        self.tracker.panicked.load(Ordering::Relaxed)
    }

    /// Blocks until no jobs are in flight.
    pub fn wait_idle(&self) {
        let mut in_flight = self.tracker.in_flight.lock();
        while *in_flight > 0 {
            self.tracker.idle.wait(&mut in_flight);
        }
    }

    /// Blocks until no jobs are in flight or the timeout elapses.
    ///
    /// Returns `true` if the pool became idle.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let mut in_flight = self.tracker.in_flight.lock();
        while *in_flight > 0 {
            if self.tracker.idle.wait_for(&mut in_flight, timeout).timed_out() {
                return *in_flight == 0;
            }
        }
        true
    }

    /// Stops accepting jobs and joins the workers after the queue drains.
    pub fn shutdown(&mut self) {
        self.sender = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .field("inline", &self.inline)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_pool_runs_all_jobs() {
        let pool = WorkerPool::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit failed");
        }
        pool.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(pool.completed(), 50);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_inline_pool_runs_immediately() {
        let pool = WorkerPool::inline();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .expect("submit failed");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(pool.is_inline());
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1);
        pool.submit(|| panic!("boom")).expect("submit failed");
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .expect("submit failed");
        assert!(pool.wait_idle_timeout(Duration::from_secs(10)));
        assert_eq!(pool.panicked(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let mut pool = WorkerPool::new(1);
        pool.shutdown();
        assert_eq!(pool.submit(|| {}), Err(PoolError::ShutDown));
    }

    #[test]
    fn test_default_size_is_positive() {
        assert!(WorkerPool::default_size() >= 1);
    }
}
