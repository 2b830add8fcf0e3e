//! Worker pool for job execution
//!
//! This module provides:
//! - [`WorkerPool`] - Fixed set of workers fed from a bounded queue
//! - [`WorkerPoolConfig`] - Worker count, queue capacity and shutdown budget
//! - [`WorkerState`] - Per-worker idle/busy/stopped view
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         WorkerPool                            │
//! │                                                               │
//! │  enqueue ──▶ ┌──────────────────┐                             │
//! │              │ BoundedJobQueue  │                             │
//! │              └────────┬─────────┘                             │
//! │                       │ pop (only when a slot is available)   │
//! │                       ▼                                       │
//! │              ┌──────────────────┐   idle slots (oneshot tx)   │
//! │              │    Dispatcher    │◀──────────────┐             │
//! │              └────────┬─────────┘               │             │
//! │                       │ one job per slot        │             │
//! │                       ▼                         │             │
//! │   [Worker 0] [Worker 1] ... [Worker N-1] ───────┘             │
//! │   (catch panics, enforce job deadlines, report outcome)       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A job leaves the queue only after some worker has offered a slot, so the
//! number of running jobs never exceeds the worker count and jobs waiting for
//! a worker stay visible (and bounded) in the queue.

mod dispatcher;
mod executor;
mod pool;

pub use executor::WorkerState;
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStats, WorkerPoolStatus};
