//! Task-processing core
//!
//! [`TaskCore`] wires the components together:
//!
//! ```text
//!  producer ──submit──▶ TokenBucketLimiter ──▶ BoundedJobQueue ──▶ Dispatcher
//!                         (rate gate)           (capacity gate)        │
//!                                                                      ▼
//!                                     ┌──────── WorkerPool (N workers) ────────┐
//!                                     │  handler(job, ctx)                     │
//!                                     │    ├─▶ CircuitBreaker ─▶ downstream    │
//!                                     │    └─▶ ShardedStore (shared counters)  │
//!                                     └────────────────────────────────────────┘
//! ```
//!
//! Admission is synchronous: a job that cannot enter is rejected with a
//! [`SubmitError`] at once rather than left waiting, so overload shows up as
//! a rising rejection rate instead of growing latency or memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::admission::{QueueError, RateLimitError, TokenBucketLimiter};
use crate::cancel::{CancelContext, CancelReason};
use crate::config::{ConfigError, CoreConfig};
use crate::job::{Job, JobOutcome, JobTicket};
use crate::reliability::{CircuitBreaker, CircuitBreakerStats};
use crate::store::{ShardStats, ShardedStore};
use crate::worker::{WorkerPool, WorkerPoolError, WorkerPoolStats};

/// Why a submission was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("queue is full")]
    QueueFull,

    #[error("queue is closed")]
    QueueClosed,

    #[error("rate limited")]
    RateLimited,

    /// The caller's context ended before the job was accepted
    #[error("submission {0}")]
    Cancelled(CancelReason),
}

impl SubmitError {
    /// Load shed by admission control, as opposed to shutdown or cancellation
    pub fn is_admission_rejected(&self) -> bool {
        matches!(self, Self::QueueFull | Self::RateLimited)
    }
}

impl<T> From<QueueError<T>> for SubmitError {
    fn from(err: QueueError<T>) -> Self {
        match err {
            QueueError::Full(_) => Self::QueueFull,
            QueueError::Closed(_) => Self::QueueClosed,
        }
    }
}

impl From<RateLimitError> for SubmitError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Cancelled(e) => Self::Cancelled(e.reason),
        }
    }
}

/// Admission counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AdmissionStats {
    pub accepted: u64,
    pub rate_limited: u64,
    pub queue_full: u64,
    pub queue_closed: u64,
}

/// Read-only snapshot of the whole core
#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub tokens_available: f64,
    pub admission: AdmissionStats,
    pub workers: WorkerPoolStats,
    pub breaker: CircuitBreakerStats,
    pub store_entries: usize,
    pub shards: Vec<ShardStats>,
}

#[derive(Debug, Default)]
struct AdmissionCounters {
    accepted: AtomicU64,
    rate_limited: AtomicU64,
    queue_full: AtomicU64,
    queue_closed: AtomicU64,
}

impl AdmissionCounters {
    fn snapshot(&self) -> AdmissionStats {
        AdmissionStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            queue_closed: self.queue_closed.load(Ordering::Relaxed),
        }
    }
}

/// Shared key/value state handed to job handlers
pub type SharedStore = ShardedStore<String, serde_json::Value>;

/// Concurrent task-processing core
///
/// # Example
///
/// ```
/// use bulwark_core::{CancelContext, CoreConfig, JobError, TaskCore};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let core = TaskCore::new(CoreConfig::new().with_worker_count(2))?;
///
/// let store = core.store();
/// core.register_handler(move |job, _ctx| {
///     let store = store.clone();
///     async move {
///         let tenant = job.payload["tenant"].as_str().unwrap_or("unknown").to_string();
///         store.update(format!("uploads:{tenant}"), |n| {
///             *n = json!(n.as_u64().unwrap_or(0) + 1);
///         });
///         Ok::<_, JobError>(json!({"stored": true}))
///     }
/// });
/// core.start()?;
///
/// let ctx = CancelContext::new();
/// let ticket = core.submit(json!({"tenant": "clinic-7"}), &ctx)?;
/// assert_eq!(ticket.wait().await?, json!({"stored": true}));
///
/// core.shutdown(&ctx).await?;
/// # Ok(())
/// # }
/// ```
pub struct TaskCore {
    config: CoreConfig,
    limiter: TokenBucketLimiter,
    pool: WorkerPool,
    breaker: Arc<CircuitBreaker>,
    store: Arc<SharedStore>,
    admission: AdmissionCounters,
}

impl TaskCore {
    /// Build every component from `config`
    pub fn new(config: CoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            limiter: TokenBucketLimiter::new(config.token_bucket()),
            pool: WorkerPool::new(config.worker_pool()),
            breaker: Arc::new(CircuitBreaker::named("downstream", config.circuit_breaker())),
            store: Arc::new(ShardedStore::new(config.shard_count)),
            admission: AdmissionCounters::default(),
            config,
        })
    }

    /// Install the per-job processing logic
    pub fn register_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Job, CancelContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = JobOutcome> + Send + 'static,
    {
        self.pool.register_handler(handler);
    }

    /// Spawn the workers; must be called from within a Tokio runtime
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        self.pool.start()
    }

    /// Admit a job or reject it immediately
    ///
    /// A token is taken before the queue is checked, so a submission refused
    /// for a full queue still counts against the rate. The job carries the
    /// tighter of its own deadline and `ctx`'s, and is abandoned if `ctx` is
    /// cancelled before it finishes.
    pub fn submit(&self, job: impl Into<Job>, ctx: &CancelContext) -> Result<JobTicket, SubmitError> {
        if let Some(reason) = ctx.reason() {
            return Err(SubmitError::Cancelled(reason));
        }

        if !self.limiter.allow() {
            self.admission.rate_limited.fetch_add(1, Ordering::Relaxed);
            debug!("Submission rate limited");
            return Err(SubmitError::RateLimited);
        }

        self.enqueue(job.into(), ctx)
    }

    /// Like [`submit`](Self::submit), but waits for a rate token instead of
    /// rejecting; a full queue still rejects at once
    pub async fn submit_wait(
        &self,
        job: impl Into<Job>,
        ctx: &CancelContext,
    ) -> Result<JobTicket, SubmitError> {
        self.limiter.wait(ctx).await?;
        self.enqueue(job.into(), ctx)
    }

    fn enqueue(&self, job: Job, ctx: &CancelContext) -> Result<JobTicket, SubmitError> {
        let job = bound_deadline(job, ctx);

        match self.pool.enqueue_with(job, ctx) {
            Ok(ticket) => {
                self.admission.accepted.fetch_add(1, Ordering::Relaxed);
                Ok(ticket)
            }
            Err(e) => {
                let counter = if e.is_full() {
                    &self.admission.queue_full
                } else {
                    &self.admission.queue_closed
                };
                counter.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Submission rejected");
                Err(e.into())
            }
        }
    }

    /// Breaker guarding the downstream dependency
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    /// Store shared by every job handler
    pub fn store(&self) -> Arc<SharedStore> {
        Arc::clone(&self.store)
    }

    pub fn limiter(&self) -> &TokenBucketLimiter {
        &self.limiter
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Close admission and drain queued and running jobs
    ///
    /// See [`WorkerPool::shutdown`] for deadline handling.
    pub async fn shutdown(&self, ctx: &CancelContext) -> Result<(), WorkerPoolError> {
        self.pool.shutdown(ctx).await
    }

    /// Cancel running jobs and drop queued ones
    pub async fn shutdown_now(&self) {
        self.pool.shutdown_now().await;
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            tokens_available: self.limiter.available(),
            admission: self.admission.snapshot(),
            workers: self.pool.stats(),
            breaker: self.breaker.snapshot(),
            store_entries: self.store.len(),
            shards: self.store.shard_stats(),
        }
    }
}

/// Tighten the job's deadline to the producer's, if that is earlier
fn bound_deadline(mut job: Job, ctx: &CancelContext) -> Job {
    let Some(remaining) = ctx.remaining() else {
        return job;
    };
    let elapsed = (chrono::Utc::now() - job.meta.submitted_at)
        .to_std()
        .unwrap_or_default();
    let candidate = elapsed.saturating_add(remaining);
    job.meta.deadline = Some(match job.meta.deadline {
        Some(existing) => existing.min(candidate),
        None => candidate,
    });
    job
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::job::JobError;

    fn core(config: CoreConfig) -> TaskCore {
        TaskCore::new(config).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = CoreConfig::new();
        config.token_refill_rate = f64::NAN;
        assert!(TaskCore::new(config).is_err());
    }

    #[test]
    fn test_admission_rejected_classification() {
        assert!(SubmitError::QueueFull.is_admission_rejected());
        assert!(SubmitError::RateLimited.is_admission_rejected());
        assert!(!SubmitError::QueueClosed.is_admission_rejected());
        assert!(!SubmitError::Cancelled(CancelReason::Cancelled).is_admission_rejected());
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_burst() {
        let core = core(
            CoreConfig::new()
                .with_queue_capacity(100)
                .with_rate_limit(3.0, 0.001),
        );
        let ctx = CancelContext::new();

        for _ in 0..3 {
            core.submit(json!({}), &ctx).unwrap();
        }
        assert_eq!(core.submit(json!({}), &ctx).unwrap_err(), SubmitError::RateLimited);

        let stats = core.stats();
        assert_eq!(stats.admission.accepted, 3);
        assert_eq!(stats.admission.rate_limited, 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_rejects_submission() {
        let core = core(CoreConfig::new());
        let ctx = CancelContext::new();
        ctx.cancel();

        assert_eq!(
            core.submit(json!({}), &ctx).unwrap_err(),
            SubmitError::Cancelled(CancelReason::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_wait_waits_for_token() {
        let core = core(CoreConfig::new().with_rate_limit(1.0, 2.0));
        let ctx = CancelContext::new();

        core.submit(json!(1), &ctx).unwrap();
        assert_eq!(core.submit(json!(2), &ctx).unwrap_err(), SubmitError::RateLimited);

        let started = tokio::time::Instant::now();
        core.submit_wait(json!(3), &ctx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_wait_honours_deadline() {
        let core = core(CoreConfig::new().with_rate_limit(1.0, 0.001));
        core.submit(json!(1), &CancelContext::new()).unwrap();

        let ctx = CancelContext::with_timeout(Duration::from_millis(50));
        assert_eq!(
            core.submit_wait(json!(2), &ctx).await.unwrap_err(),
            SubmitError::Cancelled(CancelReason::DeadlineExceeded)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_wait_with_negligible_rate_honours_deadline() {
        let config = CoreConfig::new().with_rate_limit(1.0, 1e-30);
        assert!(config.validate().is_ok());
        let core = core(config);
        core.submit(json!(1), &CancelContext::new()).unwrap();

        let ctx = CancelContext::with_timeout(Duration::from_millis(50));
        assert_eq!(
            core.submit_wait(json!(2), &ctx).await.unwrap_err(),
            SubmitError::Cancelled(CancelReason::DeadlineExceeded)
        );
    }

    #[test]
    fn test_producer_deadline_bounds_job_deadline() {
        let ctx = CancelContext::with_timeout(Duration::from_secs(2));

        let job = bound_deadline(Job::new(json!(1)), &ctx);
        let deadline = job.meta.deadline.unwrap();
        assert!(deadline <= Duration::from_secs(2));

        let tight = Job::new(json!(1)).with_deadline(Duration::from_millis(10));
        let job = bound_deadline(tight, &ctx);
        assert_eq!(job.meta.deadline, Some(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn test_breaker_and_store_are_shared_with_handlers() {
        let core = core(CoreConfig::new().with_worker_count(2));
        let breaker = core.breaker();
        let store = core.store();

        core.register_handler(move |job, _ctx| {
            let (breaker, store) = (breaker.clone(), store.clone());
            async move {
                let fail = job.payload["fail"].as_bool().unwrap_or(false);
                breaker
                    .execute(|| async move {
                        if fail {
                            Err("upstream 503")
                        } else {
                            Ok(())
                        }
                    })
                    .await?;
                store.update("ok".to_string(), |n| *n = json!(n.as_u64().unwrap_or(0) + 1));
                Ok::<_, JobError>(json!("ok"))
            }
        });
        core.start().unwrap();

        let ctx = CancelContext::new();
        let ok = core.submit(json!({"fail": false}), &ctx).unwrap();
        let failed = core.submit(json!({"fail": true}), &ctx).unwrap();

        assert_eq!(ok.wait().await, Ok(json!("ok")));
        assert_eq!(
            failed.wait().await,
            Err(JobError::Downstream("upstream 503".into()))
        );
        assert_eq!(core.store().get("ok"), Some(json!(1)));

        core.shutdown(&ctx).await.unwrap();
        let stats = core.stats();
        assert_eq!(stats.breaker.failed_calls, 1);
        assert_eq!(stats.workers.completed, 1);
        assert_eq!(stats.workers.failed, 1);
    }

    #[tokio::test]
    async fn test_stats_serialize() {
        let core = core(CoreConfig::new().with_shard_count(4));
        core.store().set("k".into(), json!(1));

        let value = serde_json::to_value(core.stats()).unwrap();

        assert_eq!(value["workers"]["status"], "created");
        assert_eq!(value["breaker"]["state"], "closed");
        assert_eq!(value["shards"].as_array().map(Vec::len), Some(4));
        assert_eq!(value["store_entries"], 1);
    }
}
