//! # Pacekit
//!
//! Concurrency and resource-control primitives for services that issue large
//! volumes of outbound work: crawlers, fetchers, bulk API clients.
//!
//! ## Features
//!
//! - **Rate limiting**: Token buckets that tolerate clock jumps and repair corrupted state
//! - **Circuit breakers**: Fail fast against a failing upstream, probe for recovery
//! - **Worker pools**: Fixed-size async workers with bounded queues and per-job metrics
//! - **Adaptive batching**: Batch sizes tuned from measured flush latency
//! - **Resource limits**: Counting limiters that ignore unmatched releases
//! - **Backoff**: Capped retry delays with optional jitter
//! - **Sharded maps and pools**: Low-contention shared state and allocation reuse
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (bounded input queue, N workers, results/errors channels)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ each job
//!                              ▼
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │ TokenBucket  │   │ ResourceLimiter  │   │  CircuitBreaker  │
//! │ (pace)       │   │ (cap in-flight)  │   │  (fail fast)     │
//! └──────────────┘   └──────────────────┘   └──────────────────┘
//!                              │ on failure
//!                              ▼
//!                     ┌──────────────────┐
//!                     │     Backoff      │
//!                     └──────────────────┘
//! ```
//!
//! Every blocking operation takes a [`Cancellation`], which carries an
//! explicit cancel signal and an optional deadline.
//!
//! ## Example
//!
//! ```
//! use pacekit::prelude::*;
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bucket = TokenBucket::new(
//!     RateLimitConfig::new()
//!         .with_max_tokens(5)
//!         .with_refill_interval(Duration::from_millis(10)),
//! );
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//!
//! bucket.wait(&Cancellation::with_timeout(Duration::from_secs(1))).await.unwrap();
//! let body: Result<&str, CircuitBreakerError<std::io::Error>> =
//!     breaker.execute(|| async { Ok("200 OK") }).await;
//! assert_eq!(body.unwrap(), "200 OK");
//! # }
//! ```

pub mod batch;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod limit;
pub mod pool;
pub mod reliability;
pub mod sharded;
pub mod warn_once;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::batch::{AdaptiveBatchProcessor, BatchConfig, BatchError};
    pub use crate::cancel::{CancelError, Cancellation};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{ConfigError, PacekitConfig};
    pub use crate::limit::{RateLimitConfig, ResourceLimiter, ResourceLimiterConfig, TokenBucket};
    pub use crate::pool::{BufferPool, Pool, PoolError};
    pub use crate::reliability::{
        Backoff, BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
        CircuitState, RetryError,
    };
    pub use crate::sharded::ShardedMap;
    pub use crate::worker::{
        MetricsSink, MetricsSnapshot, PoolOutputs, WorkerMetrics, WorkerPool, WorkerPoolConfig,
        WorkerPoolError,
    };
}

// Re-export key types at crate root
pub use batch::{AdaptiveBatchProcessor, BatchConfig, BatchError, BatchStats};
pub use cancel::{CancelError, Cancellation};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, PacekitConfig};
pub use limit::{RateLimitConfig, ResourceLimiter, ResourceLimiterConfig, SlotGuard, TokenBucket};
pub use pool::{size_class_for, BufferPool, Pool, PoolError, Pooled};
pub use reliability::{
    Backoff, BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitState, RetryError,
};
pub use sharded::ShardedMap;
pub use warn_once::WarnOnce;
pub use worker::{
    MetricsSink, MetricsSnapshot, PoolOutputs, WorkerMetrics, WorkerPool, WorkerPoolConfig,
    WorkerPoolError,
};
