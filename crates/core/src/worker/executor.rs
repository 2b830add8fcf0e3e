//! Worker loop and job execution

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::dispatcher::WorkerSlot;
use crate::cancel::{CancelContext, CancelReason};
use crate::job::{Job, JobError, JobHandler, JobOutcome};

/// A job waiting in the queue, with the channel its outcome is reported on
pub(crate) struct QueuedJob {
    pub job: Job,
    /// Producer's context; the job is abandoned if it ends first
    origin: CancelContext,
    reply: Option<oneshot::Sender<JobOutcome>>,
}

impl QueuedJob {
    pub fn new(job: Job, reply: Option<oneshot::Sender<JobOutcome>>) -> Self {
        Self {
            job,
            origin: CancelContext::new(),
            reply,
        }
    }

    pub fn with_origin(mut self, origin: CancelContext) -> Self {
        self.origin = origin;
        self
    }

    /// Report the terminal outcome; a dropped ticket is not an error
    pub fn finish(self, outcome: JobOutcome) {
        if let Some(reply) = self.reply {
            let _ = reply.send(outcome);
        }
    }
}

/// What a worker is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Stopped,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Busy,
            _ => Self::Stopped,
        }
    }
}

/// Terminal outcome counters
#[derive(Debug, Default)]
pub(crate) struct OutcomeCounters {
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub panicked: AtomicU64,
    pub cancelled: AtomicU64,
    pub dropped: AtomicU64,
}

impl OutcomeCounters {
    pub fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            Ok(_) => &self.completed,
            Err(JobError::Panicked(_)) => &self.panicked,
            Err(JobError::Cancelled(_)) => &self.cancelled,
            Err(JobError::Dropped) => &self.dropped,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by the pool handle and every worker task
pub(crate) struct PoolShared {
    pub handler: RwLock<Option<JobHandler>>,
    /// Parent of every job context; cancelled on forced shutdown
    pub jobs: CancelContext,
    pub states: Box<[AtomicU8]>,
    pub counters: OutcomeCounters,
}

impl PoolShared {
    pub fn new(worker_count: usize) -> Self {
        Self {
            handler: RwLock::new(None),
            jobs: CancelContext::new(),
            states: (0..worker_count)
                .map(|_| AtomicU8::new(WorkerState::Stopped as u8))
                .collect(),
            counters: OutcomeCounters::default(),
        }
    }

    pub fn set_state(&self, worker_id: usize, state: WorkerState) {
        self.states[worker_id].store(state as u8, Ordering::Release);
    }

    pub fn state(&self, worker_id: usize) -> WorkerState {
        WorkerState::from_u8(self.states[worker_id].load(Ordering::Acquire))
    }

    pub fn count(&self, state: WorkerState) -> usize {
        (0..self.states.len())
            .filter(|&id| self.state(id) == state)
            .count()
    }

    async fn execute(&self, worker_id: usize, queued: QueuedJob) {
        let QueuedJob { job, origin, reply } = queued;
        let job_id = job.id;

        // Context setup and the handler body share one unwind guard
        let outcome = match AssertUnwindSafe(self.run_job(worker_id, job, &origin))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker_id, %job_id, panic = %message, "Job handler panicked");
                Err(JobError::Panicked(message))
            }
        };
        if let Err(e) = &outcome {
            debug!(worker_id, %job_id, error = %e, "Job finished with error");
        }

        self.counters.record(&outcome);
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    async fn run_job(&self, worker_id: usize, job: Job, origin: &CancelContext) -> JobOutcome {
        if let Some(reason) = origin.reason() {
            return Err(JobError::Cancelled(reason));
        }

        let mut ctx = self.jobs.child();
        if let Some(remaining) = job.remaining() {
            if remaining.is_zero() {
                return Err(JobError::Cancelled(CancelReason::DeadlineExceeded));
            }
            ctx = ctx.deadline_in(remaining);
        }
        if let Some(reason) = ctx.reason() {
            return Err(JobError::Cancelled(reason));
        }

        let Some(handler) = self.handler.read().clone() else {
            warn!(worker_id, job_id = %job.id, "No handler registered");
            return Err(JobError::failed("no handler registered"));
        };

        let job_id = job.id;
        let handler_ctx = ctx.clone();
        let run = async move { handler(job, handler_ctx).await };

        tokio::select! {
            outcome = run => outcome,
            reason = ctx.done() => {
                debug!(worker_id, %job_id, %reason, "Job abandoned");
                Err(JobError::Cancelled(reason))
            }
            reason = origin.done() => {
                debug!(worker_id, %job_id, %reason, "Job abandoned by producer");
                Err(JobError::Cancelled(reason))
            }
        }
    }
}

/// Offer a slot, run the job that arrives through it, repeat
///
/// A worker stops when its slot is closed without a job or when the
/// dispatcher is gone and the offer cannot be made.
pub(crate) async fn run_worker(
    worker_id: usize,
    slots: mpsc::Sender<WorkerSlot>,
    shared: Arc<PoolShared>,
) {
    debug!(worker_id, "Worker started");

    loop {
        shared.set_state(worker_id, WorkerState::Idle);

        let (tx, rx) = oneshot::channel();
        if slots.send(WorkerSlot { worker_id, tx }).await.is_err() {
            break;
        }
        let Ok(queued) = rx.await else {
            break;
        };

        shared.set_state(worker_id, WorkerState::Busy);
        shared.execute(worker_id, queued).await;
    }

    shared.set_state(worker_id, WorkerState::Stopped);
    debug!(worker_id, "Worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
