//! Admission control
//!
//! This module provides:
//! - [`TokenBucketLimiter`] - Rate gate deciding whether new work may enter
//! - [`BoundedJobQueue`] - Fixed-capacity FIFO between producers and workers
//!
//! Together they form the admission check performed by [`crate::TaskCore::submit`]:
//! a job is accepted only if a token is available and the queue has room.

mod queue;
mod token_bucket;

pub use queue::{BoundedJobQueue, QueueError};
pub use token_bucket::{RateLimitError, TokenBucketConfig, TokenBucketLimiter};
