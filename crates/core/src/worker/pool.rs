//! Worker pool for job execution
//!
//! Runs a fixed number of workers fed by a single dispatcher, with graceful
//! and forced shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::dispatcher::run_dispatcher;
use super::executor::{run_worker, PoolShared, QueuedJob, WorkerState};
use crate::admission::{BoundedJobQueue, QueueError};
use crate::cancel::CancelContext;
use crate::config::duration_millis;
use crate::job::{Job, JobError, JobHandler, JobOutcome, JobTicket};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of workers, fixed for the pool's lifetime
    pub worker_count: usize,

    /// Jobs that may wait for a worker before submissions are rejected
    pub queue_capacity: usize,

    /// Graceful shutdown budget when the caller gives no deadline
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_capacity: 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Created, accepting jobs, workers not yet started
    Created,
    /// Workers are running
    Running,
    /// Draining queued jobs; new jobs are refused
    Draining,
    /// All workers have exited
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool has been shut down")]
    AlreadyStopped,

    #[error("no job handler registered")]
    HandlerNotRegistered,

    /// Workers were still busy when the shutdown deadline passed
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize)]
pub struct WorkerPoolStats {
    pub status: WorkerPoolStatus,
    pub worker_count: usize,
    pub busy: usize,
    pub idle: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    pub cancelled: u64,
    pub dropped: u64,
}

/// Fixed-size pool of workers draining a bounded queue
///
/// At most `worker_count` jobs run at once: a job only leaves the queue when
/// an idle worker has asked for it.
///
/// # Example
///
/// ```no_run
/// use bulwark_core::worker::{WorkerPool, WorkerPoolConfig};
/// use bulwark_core::{CancelContext, Job};
/// use serde_json::json;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = WorkerPool::new(WorkerPoolConfig::new().with_worker_count(4));
///
/// pool.register_handler(|job, _ctx| async move {
///     Ok(json!({"rendered": job.payload}))
/// });
/// pool.start()?;
///
/// let ticket = pool.enqueue(Job::new(json!({"report": 42})))?;
/// let output = ticket.wait().await?;
///
/// pool.shutdown(&CancelContext::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<BoundedJobQueue<QueuedJob>>,
    shared: Arc<PoolShared>,
    /// Stops the dispatcher on forced shutdown
    dispatch: CancelContext,
    status: Arc<RwLock<WorkerPoolStatus>>,
    /// Flips to `true` once every worker has exited
    stopped: Arc<watch::Sender<bool>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let worker_count = config.worker_count.max(1);
        Self {
            queue: Arc::new(BoundedJobQueue::new(config.queue_capacity)),
            shared: Arc::new(PoolShared::new(worker_count)),
            dispatch: CancelContext::new(),
            status: Arc::new(RwLock::new(WorkerPoolStatus::Created)),
            stopped: Arc::new(watch::channel(false).0),
            handles: Mutex::new(Vec::new()),
            config: WorkerPoolConfig {
                worker_count,
                ..config
            },
        }
    }

    /// Install the job handler, replacing any previous one
    pub fn register_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Job, CancelContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = JobOutcome> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job, ctx| Box::pin(handler(job, ctx)));
        *self.shared.handler.write() = Some(handler);
    }

    /// Spawn the workers and the dispatcher
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip(self), fields(worker_count = self.config.worker_count))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        let mut status = self.status.write();
        let current = *status;
        match current {
            WorkerPoolStatus::Created => {}
            WorkerPoolStatus::Running => return Err(WorkerPoolError::AlreadyRunning),
            WorkerPoolStatus::Draining | WorkerPoolStatus::Stopped => {
                return Err(WorkerPoolError::AlreadyStopped)
            }
        }
        if self.shared.handler.read().is_none() {
            return Err(WorkerPoolError::HandlerNotRegistered);
        }

        info!(
            worker_count = self.config.worker_count,
            queue_capacity = self.queue.capacity(),
            "Starting worker pool"
        );

        let (slots_tx, slots_rx) = mpsc::channel(self.config.worker_count);
        let mut handles = self.handles.lock();

        for worker_id in 0..self.config.worker_count {
            self.shared.set_state(worker_id, WorkerState::Idle);
            handles.push(tokio::spawn(run_worker(
                worker_id,
                slots_tx.clone(),
                Arc::clone(&self.shared),
            )));
        }
        handles.push(tokio::spawn(run_dispatcher(
            Arc::clone(&self.queue),
            slots_rx,
            self.dispatch.clone(),
        )));

        *status = WorkerPoolStatus::Running;
        Ok(())
    }

    /// Queue a job without blocking
    ///
    /// Jobs may be queued before [`start`](Self::start); they run once the
    /// workers are up.
    pub fn enqueue(&self, job: Job) -> Result<JobTicket, QueueError<Job>> {
        self.push(job, CancelContext::new())
    }

    /// Queue a job that is abandoned if `ctx` ends before it finishes
    pub fn enqueue_with(&self, job: Job, ctx: &CancelContext) -> Result<JobTicket, QueueError<Job>> {
        self.push(job, ctx.clone())
    }

    fn push(&self, job: Job, origin: CancelContext) -> Result<JobTicket, QueueError<Job>> {
        let (ticket, tx) = JobTicket::new(job.id);
        self.queue
            .push(QueuedJob::new(job, Some(tx)).with_origin(origin))
            .map(|()| ticket)
            .map_err(|e| match e {
                QueueError::Full(queued) => QueueError::Full(queued.job),
                QueueError::Closed(queued) => QueueError::Closed(queued.job),
            })
    }

    /// Stop accepting jobs and wait for queued and running jobs to finish
    ///
    /// Without a deadline on `ctx`, the configured shutdown timeout applies.
    /// If the deadline passes first, running jobs are cancelled, queued jobs
    /// are dropped, and [`WorkerPoolError::ShutdownTimeout`] is returned once
    /// the workers have exited. Concurrent callers all wait for the same drain.
    #[instrument(skip_all)]
    pub async fn shutdown(&self, ctx: &CancelContext) -> Result<(), WorkerPoolError> {
        let ctx = match ctx.deadline() {
            Some(_) => ctx.clone(),
            None => ctx.child().deadline_in(self.config.shutdown_timeout),
        };

        let queued = self.queue.len();
        if self.begin_drain() {
            info!(queued, "Draining worker pool");
        }

        tokio::select! {
            biased;
            _ = self.wait_stopped() => return Ok(()),
            reason = ctx.done() => {
                warn!(
                    %reason,
                    busy = self.shared.count(WorkerState::Busy),
                    queued = self.queue.len(),
                    "Shutdown deadline reached, cancelling remaining jobs"
                );
            }
        }

        self.force_stop();
        self.wait_stopped().await;
        Err(WorkerPoolError::ShutdownTimeout)
    }

    /// Cancel running jobs, drop queued ones, and wait for the workers to exit
    #[instrument(skip_all)]
    pub async fn shutdown_now(&self) {
        warn!(queued = self.queue.len(), "Forced shutdown");

        self.begin_drain();
        self.force_stop();
        self.wait_stopped().await;
    }

    /// Close the queue and hand the worker handles to a task that marks the
    /// pool stopped once they have all exited
    ///
    /// Returns `false` when a drain was already under way or finished.
    fn begin_drain(&self) -> bool {
        let mut status = self.status.write();
        let current = *status;
        match current {
            WorkerPoolStatus::Draining | WorkerPoolStatus::Stopped => return false,
            WorkerPoolStatus::Created => *status = WorkerPoolStatus::Stopped,
            WorkerPoolStatus::Running => *status = WorkerPoolStatus::Draining,
        }
        drop(status);

        self.queue.close();
        if current == WorkerPoolStatus::Created {
            self.drop_queued();
            self.stopped.send_replace(true);
            return true;
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        let status = Arc::clone(&self.status);
        let stopped = Arc::clone(&self.stopped);
        tokio::spawn(async move {
            join_all(handles).await;
            *status.write() = WorkerPoolStatus::Stopped;
            stopped.send_replace(true);
            info!("Worker pool stopped");
        });
        true
    }

    async fn wait_stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        // Sender is owned by the pool, so the wait only ends on `true`
        let _ = stopped.wait_for(|done| *done).await;
    }

    fn force_stop(&self) {
        self.shared.jobs.cancel();
        self.dispatch.cancel();
        self.drop_queued();
    }

    fn drop_queued(&self) {
        for queued in self.queue.drain() {
            let outcome = Err(JobError::Dropped);
            self.shared.counters.record(&outcome);
            queued.finish(outcome);
        }
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// Workers currently running a job
    pub fn busy_count(&self) -> usize {
        self.shared.count(WorkerState::Busy)
    }

    pub fn idle_count(&self) -> usize {
        self.shared.count(WorkerState::Idle)
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        (0..self.config.worker_count)
            .map(|id| self.shared.state(id))
            .collect()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// True while new jobs can be queued
    pub fn is_accepting(&self) -> bool {
        !self.queue.is_closed()
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let counters = &self.shared.counters;
        WorkerPoolStats {
            status: self.status(),
            worker_count: self.config.worker_count,
            busy: self.busy_count(),
            idle: self.idle_count(),
            queue_depth: self.queue_depth(),
            queue_capacity: self.queue_capacity(),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            panicked: counters.panicked.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.queue.close();
        self.shared.jobs.cancel();
        self.dispatch.cancel();
    }
}
