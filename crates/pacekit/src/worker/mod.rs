//! Worker pool for concurrent job execution
//!
//! This module provides:
//! - [`WorkerPool`] - Fixed set of async workers fed from a bounded queue
//! - [`WorkerMetrics`] - Default [`MetricsSink`] with lock-free counters

mod metrics;
mod pool;

pub use metrics::{MetricsSink, MetricsSnapshot, WorkerMetrics};
pub use pool::{Job, PoolOutputs, WorkerPool, WorkerPoolConfig, WorkerPoolError};
