//! Aggregate configuration
//!
//! Each component owns a `*Config` struct with defaults and `with_*` builders.
//! [`PacekitConfig`] bundles them so a service can load every setting from one
//! JSON document. Missing fields fall back to defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::limit::{RateLimitConfig, ResourceLimiterConfig};
use crate::reliability::{BackoffConfig, CircuitBreakerConfig};
use crate::sharded::DEFAULT_SHARDS;
use crate::worker::WorkerPoolConfig;

/// Errors from loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for every component in the crate
///
/// # Example
///
/// ```
/// use pacekit::PacekitConfig;
/// use std::time::Duration;
///
/// let config = PacekitConfig::from_json(
///     r#"{ "rate_limit": { "max_tokens": 50, "refill_interval": 20 } }"#,
/// ).unwrap();
///
/// assert_eq!(config.rate_limit.max_tokens, 50);
/// assert_eq!(config.rate_limit.refill_interval, Duration::from_millis(20));
/// assert_eq!(config.circuit_breaker.failure_threshold, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PacekitConfig {
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub backoff: BackoffConfig,
    pub resource_limiter: ResourceLimiterConfig,
    pub worker_pool: WorkerPoolConfig,
    pub batch: BatchConfig,

    /// Requested shard count for sharded maps
    pub map_shards: usize,
}

impl Default for PacekitConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            backoff: BackoffConfig::default(),
            resource_limiter: ResourceLimiterConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            batch: BatchConfig::default(),
            map_shards: DEFAULT_SHARDS,
        }
    }
}

impl PacekitConfig {
    /// Parse from JSON and validate
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that components would otherwise silently clamp
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.rate_limit.max_tokens == 0 {
            return invalid("rate_limit.max_tokens must be positive");
        }
        if self.rate_limit.refill_interval.is_zero() {
            return invalid("rate_limit.refill_interval must be positive");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be positive");
        }
        if !(self.backoff.multiplier.is_finite() && self.backoff.multiplier > 0.0) {
            return invalid("backoff.multiplier must be a positive number");
        }
        if self.resource_limiter.capacity == 0 {
            return invalid("resource_limiter.capacity must be positive");
        }
        if self.worker_pool.workers == 0 {
            return invalid("worker_pool.workers must be positive");
        }
        if self.worker_pool.queue_capacity == 0 || self.worker_pool.output_capacity == 0 {
            return invalid("worker_pool channel capacities must be positive");
        }
        if self.batch.min_size == 0 {
            return invalid("batch.min_size must be positive");
        }
        if self.batch.min_size > self.batch.max_size {
            return invalid("batch.min_size must not exceed batch.max_size");
        }
        if self.map_shards == 0 {
            return invalid("map_shards must be positive");
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Smallest interval any timer in the crate is allowed to use
pub(crate) const MIN_INTERVAL: Duration = Duration::from_millis(1);
