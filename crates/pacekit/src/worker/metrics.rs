//! Per-job metrics for worker pools

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Destination for per-job measurements
///
/// Called from every worker after each job, so implementations must be cheap
/// and thread-safe.
pub trait MetricsSink: Send + Sync {
    /// Record one finished job
    fn record(&self, duration: Duration, success: bool);
}

/// Lock-free job counters and latency bounds
#[derive(Debug)]
pub struct WorkerMetrics {
    succeeded: AtomicU64,
    failed: AtomicU64,
    /// Sum of all job durations (for mean calculation)
    sum_micros: AtomicU64,
    min_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
            min_micros: AtomicU64::new(u64::MAX),
            max_micros: AtomicU64::new(0),
        }
    }

    /// Point-in-time copy of the counters
    ///
    /// Fields are read independently, so a snapshot taken while jobs finish
    /// may mix values from adjacent records.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = succeeded + failed;
        let sum = self.sum_micros.load(Ordering::Relaxed);
        let min = self.min_micros.load(Ordering::Relaxed);

        MetricsSnapshot {
            total,
            succeeded,
            failed,
            mean: if total == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(sum / total)
            },
            min: if min == u64::MAX {
                Duration::ZERO
            } else {
                Duration::from_micros(min)
            },
            max: Duration::from_micros(self.max_micros.load(Ordering::Relaxed)),
        }
    }
}

impl MetricsSink for WorkerMetrics {
    fn record(&self, duration: Duration, success: bool) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);

        let mut current_min = self.min_micros.load(Ordering::Relaxed);
        while micros < current_min {
            match self.min_micros.compare_exchange_weak(
                current_min,
                micros,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current_min = observed,
            }
        }

        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }
}

/// Summary of jobs processed by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    #[serde(serialize_with = "as_millis")]
    pub mean: Duration,
    #[serde(serialize_with = "as_millis")]
    pub min: Duration,
    #[serde(serialize_with = "as_millis")]
    pub max: Duration,
}

impl MetricsSnapshot {
    /// Fraction of jobs that succeeded, or 1.0 when nothing ran
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }
}

fn as_millis<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_micros() as f64 / 1_000.0)
}
