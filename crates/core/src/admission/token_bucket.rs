//! Token bucket rate limiter
//!
//! Tokens accumulate at `refill_rate` per second up to `capacity`; each
//! admitted unit of work consumes one. The fractional token count is refilled
//! lazily on every call from the time elapsed since the last refill.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

use crate::cancel::{CancelContext, CancelError};

/// Token bucket configuration
///
/// # Example
///
/// ```
/// use bulwark_core::admission::TokenBucketConfig;
///
/// // Bursts of 10, sustained 5 per second
/// let config = TokenBucketConfig::new(10.0, 5.0);
/// assert_eq!(config.capacity, 10.0);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TokenBucketConfig {
    /// Maximum tokens held (burst size)
    pub capacity: f64,

    /// Tokens added per second
    pub refill_rate: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 1000.0,
            refill_rate: 1000.0,
        }
    }
}

impl TokenBucketConfig {
    /// Capacity is raised to at least one token; negative rates become zero
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_rate: refill_rate.max(0.0),
        }
    }
}

/// Rate limiter errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    /// The caller's context ended before a token became available
    #[error("rate limit wait abandoned: {0}")]
    Cancelled(#[from] CancelError),
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Admission-rate gate shared by all producers
///
/// The critical section is a handful of float operations under a
/// `parking_lot` mutex; no await happens while it is held.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    bucket: Mutex<Bucket>,
    allowed: AtomicU64,
    rejected: AtomicU64,
}

impl TokenBucketLimiter {
    /// Create a limiter with a full bucket
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TokenBucketConfig {
        &self.config
    }

    /// Take one token if available; never blocks
    pub fn allow(&self) -> bool {
        self.allow_n(1.0)
    }

    /// Take `n` tokens at once if all are available
    pub fn allow_n(&self, n: f64) -> bool {
        let granted = {
            let mut bucket = self.bucket.lock();
            self.refill(&mut bucket, Instant::now());
            if bucket.tokens >= n {
                bucket.tokens -= n;
                true
            } else {
                false
            }
        };

        if granted {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        granted
    }

    /// Block until a token is available or `ctx` ends
    pub async fn wait(&self, ctx: &CancelContext) -> Result<(), RateLimitError> {
        loop {
            ctx.check()?;

            let delay = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket, Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(self.time_until_token(bucket.tokens))
                }
            };

            let Some(delay) = delay else {
                self.allowed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            };

            match delay {
                Some(delay) => {
                    trace!(delay_ms = delay.as_millis() as u64, "Waiting for token");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        reason = ctx.done() => return Err(CancelError::from(reason).into()),
                    }
                }
                // No refill within a representable delay: only cancellation ends the wait
                None => return Err(CancelError::from(ctx.done().await).into()),
            }
        }
    }

    /// Tokens currently available (after refilling)
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        bucket.tokens
    }

    pub fn allowed_count(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.config.refill_rate).min(self.config.capacity);
        bucket.last_refill = now;
    }

    fn time_until_token(&self, tokens: f64) -> Option<Duration> {
        if self.config.refill_rate <= 0.0 {
            return None;
        }
        let missing = (1.0 - tokens).max(0.0);
        Duration::try_from_secs_f64(missing / self.config.refill_rate).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_clamps() {
        let config = TokenBucketConfig::new(0.0, -3.0);
        assert_eq!(config.capacity, 1.0);
        assert_eq!(config.refill_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_burst_then_reject() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig::new(10.0, 5.0));

        for _ in 0..10 {
            assert!(limiter.allow());
        }
        assert!(!limiter.allow());
        assert_eq!(limiter.allowed_count(), 10);
        assert_eq!(limiter.rejected_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_law_over_two_seconds() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig::new(10.0, 5.0));
        for _ in 0..10 {
            assert!(limiter.allow());
        }

        let start = Instant::now();
        let mut allowed = 0;
        while start.elapsed() < Duration::from_secs(2) {
            if limiter.allow() {
                allowed += 1;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!((9..=11).contains(&allowed), "allowed {allowed} in 2s");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig::new(3.0, 100.0));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(limiter.available(), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_until_refill() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig::new(1.0, 2.0));
        assert!(limiter.allow());

        let start = Instant::now();
        limiter.wait(&CancelContext::new()).await.unwrap();

        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(490), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(600), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_respects_deadline() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig::new(1.0, 0.1));
        assert!(limiter.allow());

        let ctx = CancelContext::with_timeout(Duration::from_millis(100));
        let err = limiter.wait(&ctx).await.unwrap_err();

        let RateLimitError::Cancelled(cancel) = err;
        assert!(cancel.is_deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_zero_rate_ends_on_cancel() {
        let limiter = std::sync::Arc::new(TokenBucketLimiter::new(TokenBucketConfig::new(1.0, 0.0)));
        assert!(limiter.allow());

        let ctx = CancelContext::new();
        let waiter = {
            let limiter = limiter.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { limiter.wait(&ctx).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(RateLimitError::Cancelled(e)) if !e.is_deadline()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_negligible_rate_ends_on_deadline() {
        let limiter = TokenBucketLimiter::new(TokenBucketConfig::new(1.0, 1e-30));
        assert!(limiter.allow());

        let ctx = CancelContext::with_timeout(Duration::from_millis(50));
        let err = limiter.wait(&ctx).await.unwrap_err();

        let RateLimitError::Cancelled(cancel) = err;
        assert!(cancel.is_deadline());
    }
}
