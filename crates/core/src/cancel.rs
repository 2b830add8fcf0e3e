//! Cooperative cancellation context
//!
//! Every blocking call in the pipeline takes a [`CancelContext`]: the token is
//! checked at each suspension point, and an optional deadline turns into
//! [`CancelReason::DeadlineExceeded`] once it passes.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicitly cancelled (by the caller or a forced shutdown)
    Cancelled,
    /// The deadline attached to the context passed
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Error returned when an operation is abandoned because its context ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation {reason}")]
pub struct CancelError {
    pub reason: CancelReason,
}

impl CancelError {
    pub fn is_deadline(&self) -> bool {
        self.reason == CancelReason::DeadlineExceeded
    }
}

impl From<CancelReason> for CancelError {
    fn from(reason: CancelReason) -> Self {
        Self { reason }
    }
}

/// Cancellation token plus optional deadline
///
/// Cloning shares the same token. Use [`CancelContext::child`] to derive a
/// context that can be cancelled on its own without affecting the parent.
///
/// # Example
///
/// ```ignore
/// let ctx = CancelContext::with_timeout(Duration::from_millis(250));
///
/// tokio::select! {
///     result = do_work() => result,
///     reason = ctx.done() => Err(CancelError::from(reason).into()),
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancelContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelContext {
    /// A context that only ends when cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that ends after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline_in(timeout)
    }

    /// A context that ends at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Wrap an existing token
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Tighten the deadline to `timeout` from now (never loosens it).
    /// A timeout too large to represent as an instant adds no deadline.
    pub fn deadline_in(mut self, timeout: Duration) -> Self {
        let Some(candidate) = Instant::now().checked_add(timeout) else {
            return self;
        };
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(candidate),
            None => candidate,
        });
        self
    }

    /// Derive a child context: cancelled with the parent, same deadline
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline (`None` when there is no deadline)
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why the context ended, or `None` while it is still live
    pub fn reason(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.reason().is_some()
    }

    /// Fail fast if the context already ended
    pub fn check(&self) -> Result<(), CancelError> {
        match self.reason() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    /// Resolves when the context ends
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => CancelReason::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_is_live() {
        let ctx = CancelContext::new();
        assert!(!ctx.is_done());
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_child() {
        let parent = CancelContext::new();
        let child = parent.child();

        parent.cancel();

        assert_eq!(child.reason(), Some(CancelReason::Cancelled));
    }

    #[test]
    fn test_child_cancel_does_not_touch_parent() {
        let parent = CancelContext::new();
        let child = parent.child();

        child.cancel();

        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        let ctx = CancelContext::with_timeout(Duration::from_millis(50));
        assert!(ctx.check().is_ok());

        let reason = ctx.done().await;

        assert_eq!(reason, CancelReason::DeadlineExceeded);
        assert!(ctx.check().unwrap_err().is_deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_in_never_loosens() {
        let ctx = CancelContext::with_timeout(Duration::from_secs(1))
            .deadline_in(Duration::from_secs(10));

        assert!(ctx.remaining().unwrap() <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_means_no_deadline() {
        let ctx = CancelContext::with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_none());
        assert!(ctx.check().is_ok());

        let bounded = CancelContext::with_timeout(Duration::from_secs(5))
            .deadline_in(Duration::from_secs(u64::MAX));
        assert!(bounded.remaining().unwrap() <= Duration::from_secs(5));
    }
}
