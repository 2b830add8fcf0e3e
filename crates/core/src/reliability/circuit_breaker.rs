//! Circuit breaker for calls to an unreliable dependency

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::{CancelContext, CancelReason};
use crate::config::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold reached - all calls rejected
    Open,

    /// Testing if the dependency recovered - a single probe allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  open timeout   ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘ ◄────────────── └──────────┘
///      ▲                                        probe fails         │
///      │                 probe succeeds                             │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use bulwark_core::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_open_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

/// Error from a call made through the breaker
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or a half-open probe is already in flight)
    #[error("circuit breaker is open")]
    Open,

    /// The caller's context ended before the call completed
    #[error("call abandoned: {0}")]
    Cancelled(CancelReason),

    /// The protected call failed
    #[error("downstream call failed: {0}")]
    Downstream(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// The downstream error, if the call itself failed
    pub fn into_downstream(self) -> Option<E> {
        match self {
            Self::Downstream(e) => Some(e),
            _ => None,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_probe_count: u64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_probe_count: u64,
    probe_in_flight: bool,
    opened_at: Option<Instant>,
}

/// Permission to run one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Three-state guard around a downstream dependency
///
/// State lives in one small struct behind a `parking_lot` mutex. The lock is
/// never held across the protected call.
///
/// # Example
///
/// ```ignore
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
/// match breaker.execute(|| client.fetch(id)).await {
///     Ok(report) => Ok(report),
///     Err(CircuitBreakerError::Open) => Ok(cached_fallback(id)),
///     Err(e) => Err(e),
/// }
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::named("default", config)
    }

    /// Create a breaker whose name appears in log records
    pub fn named(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_probe_count: 0,
                probe_in_flight: false,
                opened_at: None,
            }),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `f` through the breaker
    ///
    /// In the open state `f` is not called and [`CircuitBreakerError::Open`]
    /// is returned immediately.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(mut guard) = self.admit() else {
            return Err(CircuitBreakerError::Open);
        };
        let result = f().await;
        guard.settle(result.is_ok());
        result.map_err(CircuitBreakerError::Downstream)
    }

    /// Run `f` through the breaker, abandoning it if `ctx` ends first
    ///
    /// An abandoned call is neither a success nor a failure; a probe slot it
    /// held is released.
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        ctx: &CancelContext,
        f: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(reason) = ctx.reason() {
            return Err(CircuitBreakerError::Cancelled(reason));
        }

        let Some(mut guard) = self.admit() else {
            return Err(CircuitBreakerError::Open);
        };
        tokio::select! {
            result = f() => {
                guard.settle(result.is_ok());
                result.map_err(CircuitBreakerError::Downstream)
            }
            reason = ctx.done() => Err(CircuitBreakerError::Cancelled(reason)),
        }
    }

    /// Current state, applying the open timeout if it has elapsed
    pub fn state(&self) -> CircuitState {
        let state = self.state.lock();
        match state.state {
            CircuitState::Open if self.open_timeout_elapsed(&state) => CircuitState::HalfOpen,
            other => other,
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerStats {
        let state = self.state.lock();
        CircuitBreakerStats {
            state: match state.state {
                CircuitState::Open if self.open_timeout_elapsed(&state) => CircuitState::HalfOpen,
                other => other,
            },
            consecutive_failures: state.consecutive_failures,
            half_open_probe_count: state.half_open_probe_count,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker closed and clear its counters
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.probe_in_flight = false;
        state.opened_at = None;
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    fn admit(&self) -> Option<CallGuard<'_>> {
        let admission = {
            let mut state = self.state.lock();
            match state.state {
                CircuitState::Closed => Some(Admission::Normal),
                CircuitState::Open => {
                    if self.open_timeout_elapsed(&state) {
                        state.state = CircuitState::HalfOpen;
                        state.probe_in_flight = true;
                        state.half_open_probe_count += 1;
                        debug!(breaker = %self.name, "Circuit breaker half-open, probing");
                        Some(Admission::Probe)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if state.probe_in_flight {
                        None
                    } else {
                        state.probe_in_flight = true;
                        state.half_open_probe_count += 1;
                        Some(Admission::Probe)
                    }
                }
            }
        };

        match admission {
            Some(admission) => {
                self.total_calls.fetch_add(1, Ordering::Relaxed);
                Some(CallGuard {
                    breaker: self,
                    admission,
                    settled: false,
                })
            }
            None => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        if admission == Admission::Probe {
            state.probe_in_flight = false;
            if state.state == CircuitState::HalfOpen {
                state.state = CircuitState::Closed;
                state.opened_at = None;
                info!(breaker = %self.name, "Circuit breaker closed after successful probe");
            }
        }
    }

    fn record_failure(&self, admission: Admission) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        match admission {
            Admission::Probe => {
                state.probe_in_flight = false;
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                warn!(breaker = %self.name, "Half-open probe failed, circuit breaker re-opened");
            }
            Admission::Normal => {
                if state.state == CircuitState::Closed
                    && state.consecutive_failures >= self.config.failure_threshold
                {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        consecutive_failures = state.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
        }
    }

    fn release_probe(&self) {
        let mut state = self.state.lock();
        state.probe_in_flight = false;
        debug!(breaker = %self.name, "Half-open probe abandoned");
    }

    fn open_timeout_elapsed(&self, state: &BreakerState) -> bool {
        state
            .opened_at
            .map(|at| at.elapsed() >= self.config.open_timeout)
            .unwrap_or(true)
    }
}

/// Tracks one admitted call; releases the probe slot on every exit path
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.record_success(self.admission);
        } else {
            self.breaker.record_failure(self.admission);
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    fn breaker(threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(threshold)
                .with_open_timeout(timeout),
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        b.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, CircuitBreakerError<&'static str>> {
        b.execute(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.open_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_config_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let b = breaker(3, Duration::from_secs(5));

        for _ in 0..2 {
            assert!(matches!(fail(&b).await, Err(CircuitBreakerError::Downstream("boom"))));
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        let calls = AtomicUsize::new(0);
        let result = b
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.snapshot().rejected_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let b = breaker(3, Duration::from_secs(5));

        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        succeed(&b).await.unwrap();
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_closes() {
        let b = breaker(3, Duration::from_secs(5));
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        assert_eq!(succeed(&b).await.unwrap(), 7);

        let stats = b.snapshot();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.half_open_probe_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_restarts_timer() {
        let b = breaker(3, Duration::from_secs(5));
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        // Timer restarted at the probe failure
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(succeed(&b).await.unwrap_err().is_open());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_in_flight() {
        let b = Arc::new(breaker(1, Duration::from_secs(1)));
        fail(&b).await.unwrap_err();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    release_rx.await.ok();
                    Ok::<_, &'static str>(1)
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // Concurrent caller while the probe is running
        assert!(succeed(&b).await.unwrap_err().is_open());

        release_tx.send(()).unwrap();
        assert_eq!(probe.await.unwrap().unwrap(), 1);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_releases_slot() {
        let b = breaker(1, Duration::from_secs(1));
        fail(&b).await.unwrap_err();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let ctx = CancelContext::with_timeout(Duration::from_millis(10));
        let result = b
            .execute_with(&ctx, || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(matches!(
            result,
            Err(CircuitBreakerError::Cancelled(CancelReason::DeadlineExceeded))
        ));

        // Still half-open, and the next caller gets to probe
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(succeed(&b).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_closes() {
        let b = breaker(1, Duration::from_secs(600));
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        b.reset();

        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(succeed(&b).await.unwrap(), 7);
    }
}
