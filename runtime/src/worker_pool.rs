//! Bounded worker pool.
//!
//! A fixed number of long-lived tasks drain one bounded queue. Submission never
//! waits: when the queue is full the job is handed back as
//! [`SubmitError::Busy`] so the caller can shed load.
//!
//! ```text
//! submit ──try_send──▶ [ queue (capacity) ] ──▶ worker 0..N ──▶ JobHandler
//!    │                                                  │
//!    └── Busy(job) when full                            └── panic / deadline: logged, worker continues
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use quicket_runtime::worker_pool::{WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let pool: WorkerPool<u64> = WorkerPool::start(
//!     "settlement",
//!     WorkerPoolConfig::new(5, 100),
//!     Arc::new(|job: u64| async move { tracing::info!(job, "settled") }),
//! );
//!
//! if let Err(err) = pool.submit(7) {
//!     tracing::warn!(error = %err, "settlement queue full");
//! }
//! # }
//! ```

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::{counter, gauge};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Processes one job. Errors are the handler's own business; the pool only
/// observes completion, panic, or deadline.
pub trait JobHandler<J>: Send + Sync {
    /// Run the job to completion.
    fn handle(&self, job: J) -> BoxFuture<'_, ()>;
}

impl<J, F, Fut> JobHandler<J> for F
where
    F: Fn(J) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, job: J) -> BoxFuture<'_, ()> {
        Box::pin(self(job))
    }
}

/// Sizing and deadline for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Jobs that may wait in the queue.
    pub capacity: usize,
    /// Per-job deadline; a job exceeding it is abandoned.
    pub job_timeout: Option<Duration>,
}

impl WorkerPoolConfig {
    /// `workers` tasks over a queue of `capacity`, no deadline.
    ///
    /// Both are clamped to at least 1.
    #[must_use]
    pub const fn new(workers: usize, capacity: usize) -> Self {
        Self {
            workers: if workers == 0 { 1 } else { workers },
            capacity: if capacity == 0 { 1 } else { capacity },
            job_timeout: None,
        }
    }

    /// Set the per-job deadline.
    #[must_use]
    pub const fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new(5, 100).with_job_timeout(Duration::from_secs(30))
    }
}

/// Rejected submission. The job is returned to the caller.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmitError<J> {
    /// The queue is at capacity.
    #[error("worker pool is busy")]
    Busy(J),

    /// The pool is shutting down.
    #[error("worker pool is closed")]
    Closed(J),
}

impl<J> SubmitError<J> {
    /// Recover the rejected job.
    pub fn into_job(self) -> J {
        match self {
            Self::Busy(job) | Self::Closed(job) => job,
        }
    }
}

/// A running pool.
pub struct WorkerPool<J> {
    name: &'static str,
    capacity: usize,
    sender: RwLock<Option<mpsc::Sender<J>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn the workers. Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(
        name: &'static str,
        config: WorkerPoolConfig,
        handler: Arc<dyn JobHandler<J>>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..config.workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    name,
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&handler),
                    config.job_timeout,
                ))
            })
            .collect();

        tracing::info!(
            pool = name,
            workers = config.workers,
            capacity = config.capacity,
            job_timeout_ms = config.job_timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            "Worker pool started"
        );

        Self {
            name,
            capacity: config.capacity,
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a job without waiting.
    ///
    /// # Errors
    ///
    /// - [`SubmitError::Busy`] if the queue is full
    /// - [`SubmitError::Closed`] after [`WorkerPool::shutdown`]
    pub fn submit(&self, job: J) -> Result<(), SubmitError<J>> {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(SubmitError::Closed(job));
        };

        match sender.try_send(job) {
            Ok(()) => {
                counter!("quicket_worker_pool_jobs_total", "pool" => self.name, "outcome" => "accepted")
                    .increment(1);
                gauge!("quicket_worker_pool_queue_depth", "pool" => self.name).increment(1.0);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                counter!("quicket_worker_pool_jobs_total", "pool" => self.name, "outcome" => "busy")
                    .increment(1);
                Err(SubmitError::Busy(job))
            }
            Err(mpsc::error::TrySendError::Closed(job)) => Err(SubmitError::Closed(job)),
        }
    }

    /// Jobs waiting in the queue.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map_or(0, |sender| self.capacity.saturating_sub(sender.capacity()))
    }

    /// Queue capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting jobs and wait up to `grace` for queued jobs to finish.
    ///
    /// Returns `true` if every worker exited in time. Workers still running
    /// after `grace` are aborted.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_ok()
        {
            tracing::info!(pool = self.name, "Worker pool drained");
            true
        } else {
            tracing::warn!(
                pool = self.name,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "Worker pool did not drain in time, aborting workers"
            );
            for abort in aborts {
                abort.abort();
            }
            false
        }
    }
}

async fn run_worker<J: Send + 'static>(
    pool: &'static str,
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<J>>>,
    handler: Arc<dyn JobHandler<J>>,
    job_timeout: Option<Duration>,
) {
    tracing::debug!(pool, worker_id, "Worker started");

    loop {
        let job = receiver.lock().await.recv().await;
        let Some(job) = job else { break };
        gauge!("quicket_worker_pool_queue_depth", "pool" => pool).decrement(1.0);

        let run = AssertUnwindSafe(handler.handle(job)).catch_unwind();
        let outcome = match job_timeout {
            Some(deadline) => tokio::time::timeout(deadline, run).await.ok(),
            None => Some(run.await),
        };

        let label = match outcome {
            Some(Ok(())) => "completed",
            Some(Err(panic)) => {
                tracing::error!(pool, worker_id, panic = %panic_message(&*panic), "Job panicked");
                "panicked"
            }
            None => {
                tracing::warn!(pool, worker_id, "Job exceeded its deadline and was abandoned");
                "timed_out"
            }
        };
        counter!("quicket_worker_pool_jobs_total", "pool" => pool, "outcome" => label).increment(1);
    }

    tracing::debug!(pool, worker_id, "Worker stopped");
}

/// Text of a caught panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
