//! Job model
//!
//! A [`Job`] is owned by the producer until the queue accepts it, then by the
//! queue, dispatcher and worker until it reaches a terminal [`JobOutcome`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::cancel::{CancelContext, CancelReason};
use crate::reliability::CircuitBreakerError;

/// Time-ordered job identifier
pub type JobId = Uuid;

/// Advisory priority carried with a job; the queue itself stays FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Low,
    Normal,
    High,
}

/// Submission metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    pub submitted_at: DateTime<Utc>,

    /// Relative to `submitted_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<PriorityClass>,
}

/// One unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: serde_json::Value,
    pub meta: JobMeta,
}

impl Job {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            payload,
            meta: JobMeta {
                submitted_at: Utc::now(),
                deadline: None,
                priority_class: None,
            },
        }
    }

    /// Give up on the job if it has not finished within `deadline` of submission
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.meta.deadline = Some(deadline);
        self
    }

    pub fn with_priority(mut self, priority: PriorityClass) -> Self {
        self.meta.priority_class = Some(priority);
        self
    }

    /// Time left before the job's deadline, measured from submission
    ///
    /// `Some(Duration::ZERO)` means the deadline already passed.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.meta.deadline?;
        let elapsed = (Utc::now() - self.meta.submitted_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Some(deadline.saturating_sub(elapsed))
    }
}

impl From<serde_json::Value> for Job {
    fn from(payload: serde_json::Value) -> Self {
        Self::new(payload)
    }
}

/// Terminal failure of a job
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The handler reported a failure
    #[error("job failed: {0}")]
    Failed(String),

    /// A downstream call made by the handler failed
    #[error("downstream error: {0}")]
    Downstream(String),

    /// A downstream dependency is known to be unhealthy
    #[error("circuit breaker is open")]
    BreakerOpen,

    /// The handler panicked; the worker survived
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The job's deadline passed or it was cancelled
    #[error("job {0}")]
    Cancelled(CancelReason),

    /// The job never ran (forced shutdown)
    #[error("job dropped before execution")]
    Dropped,
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

impl<E: std::fmt::Display> From<CircuitBreakerError<E>> for JobError {
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Open => Self::BreakerOpen,
            CircuitBreakerError::Cancelled(reason) => Self::Cancelled(reason),
            CircuitBreakerError::Downstream(e) => Self::Downstream(e.to_string()),
        }
    }
}

impl From<crate::cancel::CancelError> for JobError {
    fn from(err: crate::cancel::CancelError) -> Self {
        Self::Cancelled(err.reason)
    }
}

/// Result of running one job
pub type JobOutcome = Result<serde_json::Value, JobError>;

/// Per-job processing logic run by the workers
pub type JobHandler = Arc<
    dyn Fn(Job, CancelContext) -> Pin<Box<dyn Future<Output = JobOutcome> + Send>> + Send + Sync,
>;

/// Receipt for an accepted job
///
/// Dropping the ticket discards the outcome; the job still runs.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    outcome: oneshot::Receiver<JobOutcome>,
}

impl JobTicket {
    pub(crate) fn new(id: JobId) -> (Self, oneshot::Sender<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { id, outcome: rx }, tx)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(self) -> JobOutcome {
        self.outcome.await.unwrap_or(Err(JobError::Dropped))
    }
}
