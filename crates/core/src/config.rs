//! Core configuration
//!
//! [`CoreConfig`] carries every recognized option of the processing core and
//! derives the per-component configurations from it.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::TokenBucketConfig;
use crate::reliability::CircuitBreakerConfig;
use crate::worker::WorkerPoolConfig;

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for [`crate::TaskCore`]
///
/// # Example
///
/// ```
/// use bulwark_core::CoreConfig;
/// use std::time::Duration;
///
/// let config = CoreConfig::default()
///     .with_worker_count(16)
///     .with_queue_capacity(512)
///     .with_breaker_open_timeout(Duration::from_secs(10));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    /// Number of long-lived workers
    pub worker_count: usize,

    /// Maximum number of jobs waiting for a worker
    pub queue_capacity: usize,

    /// Token bucket burst size
    pub token_bucket_capacity: f64,

    /// Tokens added per second
    pub token_refill_rate: f64,

    /// Consecutive failures that open the breaker
    pub breaker_failure_threshold: u32,

    /// Time the breaker stays open before allowing a probe
    #[serde(with = "duration_millis")]
    pub breaker_open_timeout: Duration,

    /// Number of partitions in the shared store
    pub shard_count: usize,

    /// Drain deadline used when shutdown is requested without one
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Idle objects retained per object pool
    pub object_pool_max_idle: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_capacity: 1024,
            token_bucket_capacity: 1000.0,
            token_refill_rate: 1000.0,
            breaker_failure_threshold: 5,
            breaker_open_timeout: Duration::from_secs(30),
            shard_count: 64,
            shutdown_timeout: Duration::from_secs(30),
            object_pool_max_idle: 256,
        }
    }
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (unset or unparsable values keep the default):
    /// - `BULWARK_WORKER_COUNT`
    /// - `BULWARK_QUEUE_CAPACITY`
    /// - `BULWARK_BUCKET_CAPACITY`
    /// - `BULWARK_REFILL_RATE`
    /// - `BULWARK_BREAKER_THRESHOLD`
    /// - `BULWARK_BREAKER_OPEN_TIMEOUT_MS`
    /// - `BULWARK_SHARD_COUNT`
    /// - `BULWARK_SHUTDOWN_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            worker_count: env_parse("BULWARK_WORKER_COUNT").unwrap_or(defaults.worker_count),
            queue_capacity: env_parse("BULWARK_QUEUE_CAPACITY").unwrap_or(defaults.queue_capacity),
            token_bucket_capacity: env_parse("BULWARK_BUCKET_CAPACITY")
                .unwrap_or(defaults.token_bucket_capacity),
            token_refill_rate: env_parse("BULWARK_REFILL_RATE")
                .unwrap_or(defaults.token_refill_rate),
            breaker_failure_threshold: env_parse("BULWARK_BREAKER_THRESHOLD")
                .unwrap_or(defaults.breaker_failure_threshold),
            breaker_open_timeout: env_parse("BULWARK_BREAKER_OPEN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.breaker_open_timeout),
            shard_count: env_parse("BULWARK_SHARD_COUNT").unwrap_or(defaults.shard_count),
            shutdown_timeout: env_parse("BULWARK_SHUTDOWN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
            ..defaults
        }
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set bucket capacity and refill rate together
    pub fn with_rate_limit(mut self, capacity: f64, refill_per_sec: f64) -> Self {
        self.token_bucket_capacity = capacity;
        self.token_refill_rate = refill_per_sec;
        self
    }

    pub fn with_breaker_failure_threshold(mut self, threshold: u32) -> Self {
        self.breaker_failure_threshold = threshold.max(1);
        self
    }

    pub fn with_breaker_open_timeout(mut self, timeout: Duration) -> Self {
        self.breaker_open_timeout = timeout;
        self
    }

    pub fn with_shard_count(mut self, count: usize) -> Self {
        self.shard_count = count.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_object_pool_max_idle(mut self, max_idle: usize) -> Self {
        self.object_pool_max_idle = max_idle;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if !self.token_bucket_capacity.is_finite() || self.token_bucket_capacity < 1.0 {
            return Err(ConfigError::Invalid(
                "token_bucket_capacity must be a finite value >= 1".into(),
            ));
        }
        if !self.token_refill_rate.is_finite() || self.token_refill_rate <= 0.0 {
            return Err(ConfigError::Invalid(
                "token_refill_rate must be a finite positive value".into(),
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker_failure_threshold must be at least 1".into(),
            ));
        }
        if self.shard_count == 0 {
            return Err(ConfigError::Invalid("shard_count must be at least 1".into()));
        }
        Ok(())
    }

    pub fn token_bucket(&self) -> TokenBucketConfig {
        TokenBucketConfig::new(self.token_bucket_capacity, self.token_refill_rate)
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.breaker_failure_threshold)
            .with_open_timeout(self.breaker_open_timeout)
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new()
            .with_worker_count(self.worker_count)
            .with_queue_capacity(self.queue_capacity)
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
