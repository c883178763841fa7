//! Retry backoff

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::{CancelError, Cancellation};
use crate::config::duration_millis;

/// Upper bound of the random extra delay, as a fraction of the base delay
const JITTER_FACTOR: f64 = 0.1;

/// Backoff configuration
///
/// # Example
///
/// ```
/// use pacekit::{Backoff, BackoffConfig};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(
///     BackoffConfig::new()
///         .with_initial_delay(Duration::from_millis(100))
///         .with_multiplier(2.0)
///         .with_max_delay(Duration::from_secs(1))
///         .with_jitter(false),
/// );
///
/// assert_eq!(backoff.next_delay(), Duration::from_millis(200));
/// assert_eq!(backoff.next_delay(), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Base delay scaled by each attempt
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Growth factor applied per attempt
    pub multiplier: f64,

    /// Upper bound on any returned delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Add up to 10% random extra delay
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the growth factor; non-finite or non-positive values become 1.0
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = sanitize_multiplier(multiplier);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

fn sanitize_multiplier(multiplier: f64) -> f64 {
    if multiplier.is_finite() && multiplier > 0.0 {
        multiplier
    } else {
        1.0
    }
}

/// Errors returned from [`Backoff::retry`]
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error
    #[error("operation failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// Cancelled before or between attempts
    #[error("retry cancelled: {0}")]
    Cancelled(CancelError),

    #[error("max_attempts must be positive")]
    InvalidMaxAttempts,
}

/// Stateful delay calculator for retry loops
///
/// The delay for attempt `n` (1-based) is
/// `min(initial_delay * multiplier * n, max_delay)`. The curve grows linearly
/// in the attempt number. With jitter enabled, up to 10% extra is added and
/// the result is capped at `max_delay` again.
///
/// A `Backoff` belongs to a single retry loop and is not shared.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let multiplier = sanitize_multiplier(config.multiplier);
        Self {
            config: BackoffConfig { multiplier, ..config },
            attempt: 0,
        }
    }

    /// Advance the attempt counter and return the delay to wait
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        let max_nanos = u64::try_from(self.config.max_delay.as_nanos()).unwrap_or(u64::MAX) as f64;
        let base = (self.config.initial_delay.as_nanos() as f64
            * self.config.multiplier
            * f64::from(self.attempt))
        .min(max_nanos);

        let nanos = if self.config.jitter && base > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=base * JITTER_FACTOR);
            (base + extra).min(max_nanos)
        } else {
            base
        };

        Duration::from_nanos(nanos as u64)
    }

    /// Start over from the first attempt
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since creation or the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Run `op` up to `max_attempts` times, sleeping between failures
    ///
    /// Resets the backoff after a success.
    pub async fn retry<T, E, F, Fut>(
        &mut self,
        max_attempts: u32,
        cancel: &Cancellation,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if max_attempts == 0 {
            return Err(RetryError::InvalidMaxAttempts);
        }

        let mut attempts = 0;
        loop {
            cancel.check().map_err(RetryError::Cancelled)?;
            attempts += 1;

            match op().await {
                Ok(value) => {
                    self.reset();
                    return Ok(value);
                }
                Err(last) if attempts >= max_attempts => {
                    return Err(RetryError::Exhausted { attempts, last });
                }
                Err(_) => {
                    let delay = self.next_delay();
                    debug!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, backing off"
                    );
                    tokio::select! {
                        biased;
                        reason = cancel.cancelled() => return Err(RetryError::Cancelled(reason)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}
