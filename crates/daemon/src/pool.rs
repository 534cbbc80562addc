//! Bounded worker pool shared by every SFTP channel.
//!
//! The pool size is fixed at construction to `max(10, 2 × CPUs)`. Jobs beyond
//! that many wait in FIFO order for a permit; the pool never grows and never
//! rejects work while open.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::info;

/// Smallest pool ever created.
pub const MIN_POOL_SIZE: usize = 10;

/// Worker pool errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is closed")]
    Closed,

    #[error("worker job panicked")]
    Panicked,
}

/// Pool size for a host with `cpus` processors.
pub fn compute_size(cpus: usize) -> usize {
    MIN_POOL_SIZE.max(cpus.saturating_mul(2))
}

/// Number of processors reported by the OS, at least 1.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

struct PoolInner {
    size: usize,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    peak: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicU64,
}

/// Handle to the shared pool; clones refer to the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool sized for `cpus` processors.
    pub fn new(cpus: usize) -> Self {
        let size = compute_size(cpus);
        Self {
            inner: Arc::new(PoolInner {
                size,
                permits: Arc::new(Semaphore::new(size)),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                queued: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a pool sized for this host.
    pub fn for_host() -> Self {
        let cpus = available_cpus();
        let pool = Self::new(cpus);
        info!(cpus, size = pool.size(), "Worker pool sized");
        pool
    }

    /// Runs a blocking job on a pool worker.
    ///
    /// Waits for a free worker when all are busy. Dropping the returned future
    /// before the job starts withdraws it; once started the job runs to
    /// completion.
    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = {
            let _waiting = Counter::enter(&self.inner.queued);
            Arc::clone(&self.inner.permits)
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let running = inner.active.fetch_add(1, Ordering::SeqCst) + 1;
            inner.peak.fetch_max(running, Ordering::SeqCst);
            let _active = Counter { counter: &inner.active };

            let output = job();
            inner.completed.fetch_add(1, Ordering::Relaxed);
            output
        });

        handle.await.map_err(|_| PoolError::Panicked)
    }

    /// Stops accepting jobs; queued callers receive [`PoolError::Closed`].
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    /// Fixed number of workers.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Highest number of jobs ever executing at once.
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    /// Jobs finished since the pool was created.
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size())
            .field("active", &self.active())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Decrements its counter on drop.
struct Counter<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> Counter<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for Counter<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_compute_size_minimum() {
        assert_eq!(compute_size(0), 10);
        assert_eq!(compute_size(1), 10);
        assert_eq!(compute_size(2), 10);
        assert_eq!(compute_size(5), 10);
    }

    #[test]
    fn test_compute_size_scales_with_cpus() {
        assert_eq!(compute_size(6), 12);
        assert_eq!(compute_size(16), 32);
        assert_eq!(compute_size(64), 128);
        assert_eq!(compute_size(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_host_pool_at_least_minimum() {
        let pool = WorkerPool::for_host();
        assert!(pool.size() >= MIN_POOL_SIZE);
        assert_eq!(pool.size(), compute_size(available_cpus()));
    }

    #[tokio::test]
    async fn test_run_returns_output() {
        let pool = WorkerPool::new(1);
        let value = pool.run(|| 6 * 7).await.unwrap();

        assert_eq!(value, 42);
        assert_eq!(pool.completed(), 1);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_saturated_pool_queues_work() {
        let pool = WorkerPool::new(1);
        let jobs = pool.size() * 3;

        let mut handles = Vec::new();
        for i in 0..jobs {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    std::thread::sleep(Duration::from_millis(50));
                    i
                })
                .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        results.sort_unstable();

        assert_eq!(results, (0..jobs).collect::<Vec<_>>());
        assert_eq!(pool.completed(), jobs as u64);
        assert!(pool.peak() <= pool.size());
        assert!(pool.peak() > 1);
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job() {
        let pool = WorkerPool::new(1);
        let result: Result<(), _> = pool.run(|| panic!("boom")).await;

        assert_eq!(result, Err(PoolError::Panicked));
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.run(|| 1).await, Ok(1));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = WorkerPool::new(1);
        pool.close();

        assert!(pool.is_closed());
        assert_eq!(pool.run(|| ()).await, Err(PoolError::Closed));
    }
}
