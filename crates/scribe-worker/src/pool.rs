//! Worker pool

use crate::stats::{Counters, PoolStats};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pending tasks held before submissions start being dropped
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Bounded queue size
    pub queue_capacity: usize,
    /// Per-task deadline
    pub task_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            task_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of [`WorkerPool::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queue full, task discarded
    Dropped,
    /// Pool closing, task discarded
    ShuttingDown,
}

impl SubmitOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SubmitOutcome::Queued)
    }
}

/// Handed to every task when it starts
#[derive(Debug, Clone)]
pub struct TaskContext {
    name: String,
    cancel: CancellationToken,
    deadline: Instant,
}

impl TaskContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancelled when the task exceeds its deadline
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

type TaskFn = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Job {
    name: String,
    run: TaskFn,
}

/// Bounded-concurrency background worker pool
///
/// Must be created inside a tokio runtime.
pub struct WorkerPool {
    config: PoolConfig,
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let workers = config.workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    rx.clone(),
                    counters.clone(),
                    config.task_timeout,
                ))
            })
            .collect();

        info!(
            workers,
            queue_capacity = config.queue_capacity,
            task_timeout_ms = config.task_timeout.as_millis() as u64,
            "Worker pool started"
        );

        Self {
            config,
            sender: RwLock::new(Some(tx)),
            workers: Mutex::new(handles),
            counters,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Enqueue a task without waiting
    ///
    /// The task is dropped, with a warning, when the queue is full or the pool
    /// is shutting down.
    pub fn submit<F, Fut>(&self, name: impl Into<String>, task: F) -> SubmitOutcome
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let sender = self.sender.read();
        let Some(tx) = sender.as_ref() else {
            Counters::bump(&self.counters.dropped);
            warn!(task = %name, "Task submitted during shutdown, dropping");
            return SubmitOutcome::ShuttingDown;
        };

        let job = Job {
            name,
            run: Box::new(move |ctx| task(ctx).boxed()),
        };

        Counters::bump(&self.counters.queued);
        match tx.try_send(job) {
            Ok(()) => {
                Counters::bump(&self.counters.submitted);
                SubmitOutcome::Queued
            }
            Err(TrySendError::Full(job)) => {
                Counters::drop_one(&self.counters.queued);
                Counters::bump(&self.counters.dropped);
                warn!(task = %job.name, "Task queue full, dropping task");
                SubmitOutcome::Dropped
            }
            Err(TrySendError::Closed(job)) => {
                Counters::drop_one(&self.counters.queued);
                Counters::bump(&self.counters.dropped);
                warn!(task = %job.name, "Task submitted during shutdown, dropping");
                SubmitOutcome::ShuttingDown
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    pub fn is_closing(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Stop accepting tasks, then wait for queued and running ones to finish
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        // Dropping the only sender closes the queue once it is drained
        if self.sender.write().take().is_none() {
            return;
        }

        let handles = std::mem::take(&mut *self.workers.lock());
        info!(
            workers = handles.len(),
            queued = self.counters.snapshot().queued,
            "Worker pool draining"
        );

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker exited abnormally");
            }
        }

        let stats = self.stats();
        info!(
            finished = stats.finished(),
            completed = stats.completed,
            failed = stats.failed,
            timed_out = stats.timed_out,
            dropped = stats.dropped,
            "Worker pool stopped"
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers still exit once the queue drains; they are just not awaited
        if self.sender.get_mut().take().is_some() {
            debug!("Worker pool dropped without shutdown");
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    counters: Arc<Counters>,
    task_timeout: Duration,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            debug!(worker = id, "Queue closed, worker exiting");
            break;
        };

        Counters::drop_one(&counters.queued);
        Counters::bump(&counters.in_flight);
        run_job(id, job, &counters, task_timeout).await;
        Counters::drop_one(&counters.in_flight);
    }
}

async fn run_job(worker: usize, job: Job, counters: &Counters, task_timeout: Duration) {
    let Job { name, run } = job;
    let cancel = CancellationToken::new();
    let ctx = TaskContext {
        name: name.clone(),
        cancel: cancel.clone(),
        deadline: Instant::now() + task_timeout,
    };

    let started = Instant::now();
    // Building the future happens inside the guard so a panicking closure is caught too
    let guarded = AssertUnwindSafe(async move { run(ctx).await }).catch_unwind();

    match tokio::time::timeout(task_timeout, guarded).await {
        Ok(Ok(Ok(()))) => {
            Counters::bump(&counters.completed);
            debug!(
                worker,
                task = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Task completed"
            );
        }
        Ok(Ok(Err(e))) => {
            Counters::bump(&counters.failed);
            warn!(worker, task = %name, error = %e, "Worker task failed");
        }
        Ok(Err(panic)) => {
            Counters::bump(&counters.failed);
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(worker, task = %name, panic = %message, "Worker task panicked");
        }
        Err(_) => {
            cancel.cancel();
            Counters::bump(&counters.timed_out);
            warn!(
                worker,
                task = %name,
                timeout_ms = task_timeout.as_millis() as u64,
                "Worker task timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{oneshot, Notify};

    fn config(workers: usize, queue_capacity: usize) -> PoolConfig {
        PoolConfig {
            workers,
            queue_capacity,
            task_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_runs_submitted_tasks() {
        let pool = WorkerPool::new(config(2, 16));
        let hits = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let hits = hits.clone();
            let outcome = pool.submit(format!("count-{i}"), move |_ctx| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            assert_eq!(outcome, SubmitOutcome::Queued);
        }

        pool.shutdown().await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        let stats = pool.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let pool = WorkerPool::new(config(1, 2));
        let gate = Arc::new(Notify::new());
        let (started_tx, started_rx) = oneshot::channel();

        // Occupy the single worker
        let blocker = gate.clone();
        pool.submit("blocker", move |_ctx| async move {
            let _ = started_tx.send(());
            blocker.notified().await;
            Ok(())
        });
        started_rx.await.unwrap();

        // Fill the queue
        assert!(pool.submit("a", |_ctx| async { Ok(()) }).is_queued());
        assert!(pool.submit("b", |_ctx| async { Ok(()) }).is_queued());

        // Queue is full: returns immediately
        assert_eq!(pool.submit("c", |_ctx| async { Ok(()) }), SubmitOutcome::Dropped);
        assert_eq!(pool.stats().dropped, 1);
        assert_eq!(pool.stats().queued, 2);

        gate.notify_one();
        pool.shutdown().await;

        let stats = pool.stats();
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects() {
        let pool = WorkerPool::new(config(1, 16));
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let hits = hits.clone();
            pool.submit("slow", move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        pool.shutdown().await;
        assert_eq!(hits.load(Ordering::SeqCst), 5);
        assert!(pool.is_closing());

        let outcome = pool.submit("late", |_ctx| async { Ok(()) });
        assert_eq!(outcome, SubmitOutcome::ShuttingDown);

        // Second shutdown is a no-op
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_contained() {
        let pool = WorkerPool::new(config(1, 16));

        pool.submit("fails", |_ctx| async { Err(anyhow::anyhow!("boom")) });
        pool.submit("panics", |ctx| async move {
            if !ctx.is_cancelled() {
                panic!("kaboom");
            }
            Ok(())
        });
        pool.submit("panics-early", |_ctx| -> BoxFuture<'static, anyhow::Result<()>> {
            panic!("before the future exists")
        });
        pool.submit("ok", |_ctx| async { Ok(()) });

        pool.shutdown().await;

        let stats = pool.stats();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.finished(), stats.submitted);
    }

    #[tokio::test]
    async fn test_timeout_cancels_task() {
        let pool = WorkerPool::new(PoolConfig {
            workers: 1,
            queue_capacity: 4,
            task_timeout: Duration::from_millis(50),
        });
        let (token_tx, token_rx) = oneshot::channel();

        pool.submit("stuck", move |ctx| async move {
            let _ = token_tx.send(ctx.cancellation().clone());
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let token = token_rx.await.unwrap();
        pool.shutdown().await;

        assert!(token.is_cancelled());
        assert_eq!(pool.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_context_carries_name_and_deadline() {
        let pool = WorkerPool::new(config(1, 4));
        let (tx, rx) = oneshot::channel();
        let before = Instant::now();

        pool.submit("named", move |ctx| async move {
            let _ = tx.send((ctx.name().to_string(), ctx.deadline(), ctx.remaining()));
            Ok(())
        });

        let (name, deadline, remaining) = rx.await.unwrap();
        assert_eq!(name, "named");
        assert!(deadline > before);
        assert!(deadline <= Instant::now() + Duration::from_secs(5));
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::ZERO);

        pool.shutdown().await;
    }
}
