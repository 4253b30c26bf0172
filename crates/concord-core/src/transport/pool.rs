//! Demand-grown worker pool for inbound calls
//!
//! Workers are spawned when a job arrives and nobody is idle, up to a
//! maximum. A worker that stays idle longer than the idle timeout exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

type Job = BoxFuture<'static, ()>;

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub idle_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 256,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

struct PoolInner {
    config: WorkerPoolConfig,
    queue: Mutex<mpsc::UnboundedReceiver<Job>>,
    workers: AtomicUsize,
    idle: AtomicUsize,
}

#[derive(Clone)]
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Job>,
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            inner: Arc::new(PoolInner {
                config,
                queue: Mutex::new(receiver),
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a job, growing the pool if every worker is busy
    pub fn execute<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.sender.send(Box::pin(job)).is_err() {
            warn!("Worker pool queue closed, dropping job");
            return;
        }
        if self.inner.idle.load(Ordering::SeqCst) == 0 {
            self.grow();
        }
    }

    fn grow(&self) {
        let max = self.inner.config.max_workers.max(1);
        let reserved = self
            .inner
            .workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        if reserved.is_err() {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            Self::run_worker(inner).await;
        });
    }

    async fn run_worker(inner: Arc<PoolInner>) {
        loop {
            inner.idle.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut queue = inner.queue.lock().await;
                let waited = tokio::time::timeout(inner.config.idle_timeout, queue.recv()).await;
                inner.idle.fetch_sub(1, Ordering::SeqCst);
                match waited {
                    Ok(job) => job,
                    // A job queued while this worker still counted as idle
                    // must not be stranded
                    Err(_) => queue.try_recv().ok(),
                }
            };

            match next {
                Some(job) => job.await,
                None => {
                    debug!("Worker exiting");
                    break;
                }
            }
        }
        inner.workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.load(Ordering::Acquire)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(WorkerPoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::{Notify, oneshot};

    #[tokio::test]
    async fn test_slow_job_does_not_block_others() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            max_workers: 4,
            idle_timeout: Duration::from_secs(5),
        });

        let gate = Arc::new(Notify::new());
        let released = Arc::new(AtomicBool::new(false));
        {
            let gate = gate.clone();
            let released = released.clone();
            pool.execute(async move {
                gate.notified().await;
                released.store(true, Ordering::SeqCst);
            });
        }

        let (tx, rx) = oneshot::channel();
        pool.execute(async move {
            let _ = tx.send(42);
        });

        let value = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
        assert!(!released.load(Ordering::SeqCst));
        assert!(pool.worker_count() >= 2);

        gate.notify_one();
    }

    #[tokio::test]
    async fn test_idle_workers_exit() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            max_workers: 2,
            idle_timeout: Duration::from_millis(30),
        });

        let (tx, rx) = oneshot::channel();
        pool.execute(async move {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert_eq!(pool.worker_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_max_workers() {
        let pool = WorkerPool::new(WorkerPoolConfig {
            max_workers: 2,
            idle_timeout: Duration::from_secs(5),
        });
        let gate = Arc::new(Notify::new());
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let gate = gate.clone();
            let done = done.clone();
            pool.execute(async move {
                gate.notified().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.worker_count(), 2);

        for _ in 0..20 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(10)).await;
            if done.load(Ordering::SeqCst) == 6 {
                break;
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 6);
    }
}
