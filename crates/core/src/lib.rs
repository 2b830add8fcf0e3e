//! # Bulwark Core
//!
//! An in-process, concurrent task-processing core for bursty workloads.
//!
//! ## Features
//!
//! - **Admission control**: a token bucket and a bounded queue shed load synchronously
//!   instead of letting latency or memory grow without bound
//! - **Fixed worker pool**: a dispatcher hands each job to exactly one idle worker;
//!   panicking handlers never shrink the pool
//! - **Circuit breaker**: fails fast while a downstream dependency is unhealthy,
//!   with a single half-open probe
//! - **Sharded store**: per-shard locking for shared counters and caches
//! - **Object pool**: reset-on-release reuse of short-lived payload objects
//! - **Cancellation**: deadlines and cancel signals flow from the producer to the
//!   downstream call, and shutdown drains or cancels cleanly
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          TaskCore                            │
//! │   submit ─▶ TokenBucketLimiter ─▶ BoundedJobQueue            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Dispatcher ─▶ WorkerPool                     │
//! │  (one job per idle worker, panic recovery, job deadlines)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        CircuitBreaker  ·  ShardedStore  ·  ObjectPool        │
//! │      (shared by handlers, each guarding its own state)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use bulwark_core::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let core = TaskCore::new(CoreConfig::from_env())?;
//! let breaker = core.breaker();
//!
//! core.register_handler(move |job, ctx| {
//!     let breaker = breaker.clone();
//!     async move {
//!         let report = breaker
//!             .execute_with(&ctx, || async { fetch_report(&job.payload).await })
//!             .await?;
//!         Ok::<_, JobError>(json!({"report": report}))
//!     }
//! });
//! core.start()?;
//!
//! match core.submit(json!({"id": 42}), &CancelContext::new()) {
//!     Ok(ticket) => println!("{:?}", ticket.wait().await),
//!     Err(e) if e.is_admission_rejected() => println!("shed: {e}"),
//!     Err(e) => return Err(e.into()),
//! }
//!
//! core.shutdown(&CancelContext::new()).await?;
//! # Ok(())
//! # }
//! # async fn fetch_report(_: &serde_json::Value) -> Result<String, std::io::Error> {
//! #     Ok(String::new())
//! # }
//! ```

pub mod admission;
pub mod cancel;
pub mod config;
pub mod job;
pub mod reliability;
pub mod store;
pub mod telemetry;
pub mod worker;

mod task_core;

/// Prelude for common imports
pub mod prelude {
    pub use crate::cancel::{CancelContext, CancelError, CancelReason};
    pub use crate::config::CoreConfig;
    pub use crate::job::{Job, JobError, JobOutcome, JobTicket};
    pub use crate::reliability::{CircuitBreaker, CircuitBreakerError, CircuitState};
    pub use crate::store::{ObjectPool, Reset, ShardedStore};
    pub use crate::task_core::{SubmitError, TaskCore};
}

// Re-export key types at crate root
pub use admission::{
    BoundedJobQueue, QueueError, RateLimitError, TokenBucketConfig, TokenBucketLimiter,
};
pub use cancel::{CancelContext, CancelError, CancelReason};
pub use config::{ConfigError, CoreConfig};
pub use job::{Job, JobError, JobHandler, JobId, JobMeta, JobOutcome, JobTicket, PriorityClass};
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats, CircuitState,
};
pub use store::{
    DeterministicState, ObjectPool, PoolStats, PooledObject, Reset, ShardStats, ShardedStore,
};
pub use task_core::{AdmissionStats, CoreStats, SharedStore, SubmitError, TaskCore};
pub use worker::{
    WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStats, WorkerPoolStatus, WorkerState,
};
