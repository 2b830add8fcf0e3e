//! Reliability patterns for downstream calls
//!
//! This module provides:
//! - [`CircuitBreaker`] - Three-state guard that fails fast while a dependency is unhealthy
//! - [`CircuitBreakerConfig`] - Failure threshold and open timeout

mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats, CircuitState,
};
