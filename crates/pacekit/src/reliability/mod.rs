//! Failure handling for calls to unreliable upstreams
//!
//! This module provides:
//! - [`CircuitBreaker`] - Fail fast after repeated errors, probe for recovery
//! - [`Backoff`] - Growing delays between retry attempts

mod backoff;
mod circuit_breaker;

pub use backoff::{Backoff, BackoffConfig, RetryError};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
