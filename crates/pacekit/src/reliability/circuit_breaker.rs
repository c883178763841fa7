//! Circuit breaker

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::duration_millis;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold reached - all calls rejected
    Open,

    /// Reset timeout elapsed - trial calls allowed
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
/// # Example
///
/// ```
/// use pacekit::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_reset_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Time to wait after the last failure before allowing trial calls
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit (minimum 1)
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout (time before trying again after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    fn normalized(self) -> Self {
        Self {
            failure_threshold: self.failure_threshold.max(1),
            ..self
        }
    }
}

/// Errors returned from [`CircuitBreaker::execute`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not invoked
    #[error("circuit breaker is open")]
    Open,

    /// The operation ran and failed
    #[error("operation failed: {0}")]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without running
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// The operation's own error, if it ran
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(err) => Some(err),
            Self::Open => None,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker guarding calls to a single upstream
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                 └──────────┘
///      ▲                               ▲          failure          │
///      │                               └───────────────────────────┤
///      │                     success                               │
///      └───────────────────────────────────────────────────────────┘
/// ```
///
/// Half-open admits every caller until one of them reports a result, so
/// several trial calls may be in flight at once.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a breaker reading time from `clock`
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: config.normalized(),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
            clock,
        }
    }

    /// Run `op` if the circuit admits it, recording the outcome
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.allow() {
            return Err(CircuitBreakerError::Open);
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(err))
            }
        }
    }

    /// Synchronous variant of [`execute`](Self::execute)
    pub fn call<T, E>(&self, op: impl FnOnce() -> Result<T, E>) -> Result<T, CircuitBreakerError<E>> {
        if !self.allow() {
            return Err(CircuitBreakerError::Open);
        }
        match op() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(err))
            }
        }
    }

    /// Decide whether a call may proceed
    ///
    /// Moves an open circuit to half-open once the reset timeout has elapsed
    /// since the last failure.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = self.clock.now();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let waited = inner
                    .last_failure
                    .map(|failed_at| now.saturating_duration_since(failed_at))
                    .unwrap_or(Duration::MAX);
                if waited >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!(
                        waited_ms = waited.as_millis() as u64,
                        "circuit breaker: open -> half_open"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: clears failures and closes the circuit
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        if inner.state != CircuitState::Closed {
            info!(from = %inner.state, "circuit breaker: closed after success");
            inner.state = CircuitState::Closed;
        }
    }

    /// Record a failed call
    ///
    /// Opens the circuit when the failure threshold is reached, or
    /// immediately if the circuit was half-open.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(now);

        let trip = inner.state == CircuitState::HalfOpen
            || inner.failure_count >= self.config.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            warn!(
                from = %inner.state,
                failures = inner.failure_count,
                threshold = self.config.failure_threshold,
                "circuit breaker: opened"
            );
            inner.state = CircuitState::Open;
        } else {
            debug!(failures = inner.failure_count, "circuit breaker: failure recorded");
        }
    }

    /// Current state, without applying the reset timeout
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures recorded since the last success or reset
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Force the circuit closed and clear its history
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(threshold: u32, timeout: Duration) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(threshold)
            .with_reset_timeout(timeout);
        (CircuitBreaker::with_clock(config, Arc::new(clock.clone())), clock)
    }

    fn fail(cb: &CircuitBreaker) -> Result<(), CircuitBreakerError<&'static str>> {
        cb.call(|| Err("boom"))
    }

    fn succeed(cb: &CircuitBreaker) -> Result<u32, CircuitBreakerError<&'static str>> {
        cb.call(|| Ok(7))
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_threshold_clamped() {
        let config = CircuitBreakerConfig::new().with_failure_threshold(0);
        assert_eq!(config.failure_threshold, 1);
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"reset_timeout\":30000"));
        let parsed: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_opens_after_threshold() {
        let (cb, _clock) = breaker(3, Duration::from_secs(1));

        for _ in 0..2 {
            assert!(fail(&cb).is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(matches!(fail(&cb), Err(CircuitBreakerError::Operation("boom"))));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 3);
    }

    #[test]
    fn test_open_rejects_without_running() {
        let (cb, _clock) = breaker(1, Duration::from_secs(1));
        let _ = fail(&cb);

        let mut ran = false;
        let result: Result<(), CircuitBreakerError<()>> = cb.call(|| {
            ran = true;
            Ok(())
        });
        assert!(result.unwrap_err().is_open());
        assert!(!ran);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (cb, _clock) = breaker(3, Duration::from_secs(1));
        let _ = fail(&cb);
        let _ = fail(&cb);
        assert_eq!(succeed(&cb).unwrap(), 7);
        assert_eq!(cb.failure_count(), 0);

        let _ = fail(&cb);
        let _ = fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes() {
        let (cb, clock) = breaker(2, Duration::from_secs(5));
        let _ = fail(&cb);
        let _ = fail(&cb);
        assert!(!cb.allow());

        clock.advance(Duration::from_secs(4));
        assert!(!cb.allow());
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(succeed(&cb).is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (cb, clock) = breaker(3, Duration::from_secs(5));
        for _ in 0..3 {
            let _ = fail(&cb);
        }
        clock.advance(Duration::from_secs(5));
        assert!(cb.allow());

        let _ = fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        // The timeout restarts from the half-open failure
        clock.advance(Duration::from_secs(3));
        assert!(!cb.allow());
        clock.advance(Duration::from_secs(2));
        assert!(cb.allow());
    }

    #[test]
    fn test_half_open_admits_concurrent_trials() {
        let (cb, clock) = breaker(1, Duration::from_secs(1));
        let _ = fail(&cb);
        clock.advance(Duration::from_secs(1));

        assert!(cb.allow());
        assert!(cb.allow());
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_reset() {
        let (cb, _clock) = breaker(1, Duration::from_secs(60));
        let _ = fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.allow());
    }

    #[test]
    fn test_backward_clock_keeps_circuit_open() {
        let (cb, clock) = breaker(1, Duration::from_secs(5));
        let _ = fail(&cb);
        clock.rewind(Duration::from_secs(30));
        assert!(!cb.allow());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_execute_async() {
        let (cb, _clock) = breaker(1, Duration::from_secs(60));

        let ok: Result<&str, CircuitBreakerError<String>> = cb.execute(|| async { Ok("up") }).await;
        assert_eq!(ok.unwrap(), "up");

        let err: Result<(), CircuitBreakerError<String>> = cb
            .execute(|| async { Err("connection refused".to_string()) })
            .await;
        assert_eq!(
            err.unwrap_err().into_operation_error().as_deref(),
            Some("connection refused")
        );

        let rejected: Result<(), CircuitBreakerError<String>> =
            cb.execute(|| async { Ok(()) }).await;
        assert!(rejected.unwrap_err().is_open());
    }
}
