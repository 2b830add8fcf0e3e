//! Simulated downstream dependency
//!
//! Stands in for the rendering service report ingestion calls: each call
//! takes a little time and fails with a configurable probability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Errors returned by the downstream service
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownstreamError {
    #[error("downstream unavailable (status 503)")]
    Unavailable,
}

/// Receipt for a delivered report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub sequence: u64,
    pub bytes: usize,
}

/// Downstream service that fails randomly
#[derive(Debug)]
pub struct FlakyDownstream {
    failure_rate: f64,
    latency: Duration,
    calls: AtomicU64,
}

impl FlakyDownstream {
    pub fn new(failure_rate: f64, latency: Duration) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            latency,
            calls: AtomicU64::new(0),
        }
    }

    /// Deliver `bytes` of rendered report
    pub async fn deliver(&self, bytes: usize) -> Result<Receipt, DownstreamError> {
        let sequence = self.calls.fetch_add(1, Ordering::Relaxed);
        let fail = rand::random::<f64>() < self.failure_rate;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if fail {
            Err(DownstreamError::Unavailable)
        } else {
            Ok(Receipt { sequence, bytes })
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_never_fails_at_zero_rate() {
        let downstream = FlakyDownstream::new(0.0, Duration::ZERO);
        for i in 0..50 {
            let receipt = downstream.deliver(10).await.unwrap();
            assert_eq!(receipt.sequence, i);
        }
        assert_eq!(downstream.calls(), 50);
    }

    #[tokio::test]
    async fn test_always_fails_at_full_rate() {
        let downstream = FlakyDownstream::new(1.5, Duration::ZERO);
        for _ in 0..20 {
            assert_eq!(
                downstream.deliver(10).await,
                Err(DownstreamError::Unavailable)
            );
        }
    }
}
