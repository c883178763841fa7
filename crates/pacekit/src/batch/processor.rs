//! Latency-driven batch sizing

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use super::window::LatencyWindow;
use crate::cancel::Cancellation;
use crate::config::{duration_millis, MIN_INTERVAL};

/// Adaptive batching configuration
///
/// # Example
///
/// ```
/// use pacekit::BatchConfig;
/// use std::time::Duration;
///
/// let config = BatchConfig::new()
///     .with_size_bounds(10, 500)
///     .with_initial_size(50)
///     .with_target_latency(Duration::from_millis(200));
/// assert_eq!(config.initial_size, 50);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    /// Smallest batch size the processor will shrink to
    pub min_size: usize,

    /// Largest batch size the processor will grow to
    pub max_size: usize,

    /// Batch size before any flush has been measured
    pub initial_size: usize,

    /// Desired mean flush duration
    #[serde(with = "duration_millis")]
    pub target_latency: Duration,

    /// Flush a partial batch once this long has passed since the last flush
    #[serde(with = "duration_millis")]
    pub flush_timeout: Duration,

    /// Number of recent flush durations averaged for resizing
    pub history_len: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_size: 10,
            max_size: 1000,
            initial_size: 100,
            target_latency: Duration::from_millis(100),
            flush_timeout: Duration::from_secs(1),
            history_len: 10,
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size bounds; `min` is at least 1 and `max` at least `min`
    pub fn with_size_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_size = min;
        self.max_size = max;
        self.normalized()
    }

    /// Set the starting size, clamped into the size bounds
    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = size;
        self.normalized()
    }

    /// Set the desired mean flush duration (minimum 1ms)
    pub fn with_target_latency(mut self, latency: Duration) -> Self {
        self.target_latency = latency.max(MIN_INTERVAL);
        self
    }

    /// Set the partial-batch flush timeout (minimum 1ms)
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout.max(MIN_INTERVAL);
        self
    }

    /// Set how many flush durations are averaged (minimum 1)
    pub fn with_history_len(mut self, len: usize) -> Self {
        self.history_len = len.max(1);
        self
    }

    fn normalized(self) -> Self {
        let min_size = self.min_size.max(1);
        let max_size = self.max_size.max(min_size);
        Self {
            min_size,
            max_size,
            initial_size: self.initial_size.clamp(min_size, max_size),
            target_latency: self.target_latency.max(MIN_INTERVAL),
            flush_timeout: self.flush_timeout.max(MIN_INTERVAL),
            history_len: self.history_len.max(1),
            ..self
        }
    }
}

/// Errors returned from [`AdaptiveBatchProcessor`]
#[derive(Debug, thiserror::Error)]
pub enum BatchError<E> {
    /// The batch function failed; the batch's items are not retried
    #[error("batch processing failed: {0}")]
    Processing(E),
}

/// Point-in-time view of a processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub current_size: usize,
    pub buffered: usize,
    pub flushes: u64,
    #[serde(with = "duration_millis")]
    pub mean_flush_time: Duration,
}

/// Batch function invoked on each flush
pub type BatchHandler<T, E> =
    Arc<dyn Fn(Vec<T>) -> Pin<Box<dyn Future<Output = Result<(), E>> + Send>> + Send + Sync>;

struct BatchState<T> {
    items: Vec<T>,
    timings: LatencyWindow,
    last_flush: Instant,
    flushes: u64,
}

/// Buffers items and flushes them in batches sized by observed latency
///
/// After each flush the mean of recent flush durations is compared with the
/// target: above target shrinks the batch size by 20%, below half the target
/// grows it by 20%, always within `[min_size, max_size]`. Flushes are
/// serialized, and `add` waits while one is running.
///
/// # Example
///
/// ```
/// use pacekit::{AdaptiveBatchProcessor, BatchConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = BatchConfig::new().with_size_bounds(1, 100).with_initial_size(2);
/// let processor = AdaptiveBatchProcessor::new(config, |batch: Vec<u32>| async move {
///     assert!(!batch.is_empty());
///     Ok::<_, std::io::Error>(())
/// });
///
/// processor.add(1).await.unwrap();
/// processor.add(2).await.unwrap(); // reaches the batch size and flushes
/// assert_eq!(processor.buffered().await, 0);
/// # }
/// ```
pub struct AdaptiveBatchProcessor<T, E> {
    config: BatchConfig,
    handler: BatchHandler<T, E>,
    current_size: AtomicUsize,
    state: Mutex<BatchState<T>>,
}

impl<T, E> fmt::Debug for AdaptiveBatchProcessor<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveBatchProcessor")
            .field("config", &self.config)
            .field("current_size", &self.current_size.load(Ordering::Acquire))
            .finish()
    }
}

impl<T, E> AdaptiveBatchProcessor<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F, Fut>(config: BatchConfig, handler: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let config = config.normalized();
        let handler: BatchHandler<T, E> = Arc::new(move |batch| Box::pin(handler(batch)));
        Self {
            current_size: AtomicUsize::new(config.initial_size),
            state: Mutex::new(BatchState {
                items: Vec::with_capacity(config.initial_size),
                timings: LatencyWindow::new(config.history_len),
                last_flush: Instant::now(),
                flushes: 0,
            }),
            handler,
            config,
        }
    }

    /// Buffer an item, flushing if the batch is full or the timeout elapsed
    pub async fn add(&self, item: T) -> Result<(), BatchError<E>> {
        let mut state = self.state.lock().await;
        state.items.push(item);

        let full = state.items.len() >= self.current_size();
        let stale = state.last_flush.elapsed() >= self.config.flush_timeout;
        if full || stale {
            self.flush_locked(&mut state).await
        } else {
            Ok(())
        }
    }

    /// Process whatever is buffered; no-op when empty
    pub async fn flush(&self) -> Result<(), BatchError<E>> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    /// Restore the initial batch size and forget measured latencies
    pub async fn reset_batch_size(&self) {
        let mut state = self.state.lock().await;
        state.timings.clear();
        self.current_size
            .store(self.config.initial_size, Ordering::Release);
    }

    /// Batch size that triggers the next flush
    pub fn current_size(&self) -> usize {
        self.current_size.load(Ordering::Acquire)
    }

    /// Items waiting for the next flush
    pub async fn buffered(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn stats(&self) -> BatchStats {
        let state = self.state.lock().await;
        BatchStats {
            current_size: self.current_size(),
            buffered: state.items.len(),
            flushes: state.flushes,
            mean_flush_time: state.timings.mean().unwrap_or(Duration::ZERO),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    async fn flush_locked(&self, state: &mut BatchState<T>) -> Result<(), BatchError<E>> {
        if state.items.is_empty() {
            return Ok(());
        }

        let batch = std::mem::replace(&mut state.items, Vec::with_capacity(self.current_size()));
        let batch_len = batch.len();

        let started = Instant::now();
        let result = (self.handler)(batch).await;
        let elapsed = started.elapsed();

        state.last_flush = Instant::now();
        state.flushes += 1;
        state.timings.push(elapsed);
        self.resize(&state.timings);

        debug!(
            items = batch_len,
            elapsed_ms = elapsed.as_millis() as u64,
            ok = result.is_ok(),
            "Flushed batch"
        );
        result.map_err(BatchError::Processing)
    }

    fn resize(&self, timings: &LatencyWindow) {
        let Some(mean) = timings.mean() else {
            return;
        };
        let current = self.current_size();
        let target = self.config.target_latency;

        let next = if mean > target {
            (current.saturating_mul(4) / 5)
                .min(current.saturating_sub(1))
                .max(self.config.min_size)
        } else if mean < target / 2 {
            (current.saturating_mul(6) / 5)
                .max(current.saturating_add(1))
                .min(self.config.max_size)
        } else {
            current
        };

        if next != current {
            self.current_size.store(next, Ordering::Release);
            debug!(
                from = current,
                to = next,
                mean_ms = mean.as_millis() as u64,
                target_ms = target.as_millis() as u64,
                "Adjusted batch size"
            );
        }
    }
}

impl<T, E> AdaptiveBatchProcessor<T, E>
where
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    /// Spawn a task that flushes stale partial batches every `flush_timeout`
    ///
    /// The task exits when `cancel` fires. Flush errors are logged.
    pub fn spawn_flush_timer(self: &Arc<Self>, cancel: Cancellation) -> JoinHandle<()> {
        let processor = Arc::clone(self);
        let period = self.config.flush_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut state = processor.state.lock().await;
                        if state.items.is_empty() || state.last_flush.elapsed() < period {
                            continue;
                        }
                        if let Err(e) = processor.flush_locked(&mut state).await {
                            error!("Timed batch flush failed: {}", e);
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("Flush timer: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Flush timer exited");
        })
    }
}
