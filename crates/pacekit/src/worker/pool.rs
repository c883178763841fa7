//! Fixed-size worker pool
//!
//! A fixed number of tokio tasks pull items from a shared bounded queue, run a
//! job on each, and deliver the outcome on a results or errors channel.
//!
//! ```text
//!  submit ──► [ input queue ] ──► worker 0..N ──► job(item) ─┬─► results
//!                                                            └─► errors
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::metrics::{MetricsSink, WorkerMetrics};
use crate::cancel::{CancelError, Cancellation};

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use pacekit::WorkerPoolConfig;
///
/// let config = WorkerPoolConfig::new()
///     .with_name("fetchers")
///     .with_workers(16)
///     .with_queue_capacity(1_000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Name attached to log events
    pub name: String,

    /// Number of worker tasks
    pub workers: usize,

    /// Input queue capacity; `submit` waits when full
    pub queue_capacity: usize,

    /// Capacity of the results and errors channels
    pub output_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: format!("pool-{}", Uuid::now_v7()),
            workers: 4,
            queue_capacity: 100,
            output_capacity: 100,
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the worker count (minimum 1)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the input queue capacity (minimum 1)
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the results/errors channel capacity (minimum 1)
    pub fn with_output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity.max(1);
        self
    }

    fn normalized(self) -> Self {
        Self {
            workers: self.workers.max(1),
            queue_capacity: self.queue_capacity.max(1),
            output_capacity: self.output_capacity.max(1),
            ..self
        }
    }
}

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerPoolError {
    /// The pool is shutting down or closed and accepts no more work
    ///
    /// Also returned when the pool is cancelled while `submit` waits for
    /// queue space.
    #[error("worker pool is closed")]
    Closed,

    /// The caller's cancellation fired before the item was queued
    #[error("submission cancelled: {0}")]
    Cancelled(#[from] CancelError),
}

/// Job function shared by all workers
pub type Job<I, O, E> =
    Arc<dyn Fn(I) -> Pin<Box<dyn Future<Output = Result<O, E>> + Send>> + Send + Sync>;

/// Receiving ends of a pool's output channels
///
/// Both channels close once the pool has shut down and every outcome has been
/// delivered. A pool blocks on delivery when these are not drained.
#[derive(Debug)]
pub struct PoolOutputs<O, E> {
    pub results: mpsc::Receiver<O>,
    pub errors: mpsc::Receiver<E>,
}

/// Fixed-size pool of async workers
///
/// # Example
///
/// ```
/// use pacekit::{WorkerPool, WorkerPoolConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = WorkerPoolConfig::new().with_workers(2);
/// let (pool, mut outputs) = WorkerPool::start(config, |n: u32| async move {
///     if n % 2 == 0 { Ok(n * 10) } else { Err(format!("odd: {n}")) }
/// });
///
/// pool.submit(2).await.unwrap();
/// pool.submit(3).await.unwrap();
/// pool.close().await;
///
/// assert_eq!(outputs.results.recv().await, Some(20));
/// assert_eq!(outputs.errors.recv().await.as_deref(), Some("odd: 3"));
/// # }
/// ```
pub struct WorkerPool<I, O, E, M = WorkerMetrics> {
    config: WorkerPoolConfig,
    input: Mutex<Option<mpsc::Sender<I>>>,
    outputs: Mutex<Option<(mpsc::Sender<O>, mpsc::Sender<E>)>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    metrics: Arc<M>,
}

impl<I, O, E> WorkerPool<I, O, E, WorkerMetrics>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    /// Spawn workers recording into a fresh [`WorkerMetrics`]
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(config: WorkerPoolConfig, job: F) -> (Self, PoolOutputs<O, E>)
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        Self::start_with_metrics(config, Arc::new(WorkerMetrics::new()), job)
    }
}

impl<I, O, E, M> WorkerPool<I, O, E, M>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
    M: MetricsSink + 'static,
{
    /// Spawn workers recording into `metrics`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_with_metrics<F, Fut>(
        config: WorkerPoolConfig,
        metrics: Arc<M>,
        job: F,
    ) -> (Self, PoolOutputs<O, E>)
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let config = config.normalized();
        let job: Job<I, O, E> = Arc::new(move |item| Box::pin(job(item)));

        let (input_tx, input_rx) = mpsc::channel(config.queue_capacity);
        let (results_tx, results_rx) = mpsc::channel(config.output_capacity);
        let (errors_tx, errors_rx) = mpsc::channel(config.output_capacity);
        let input_rx = Arc::new(tokio::sync::Mutex::new(input_rx));
        let cancel = CancellationToken::new();

        let handles = (0..config.workers)
            .map(|worker| {
                let worker = Worker {
                    id: worker,
                    input: Arc::clone(&input_rx),
                    job: Arc::clone(&job),
                    results: results_tx.clone(),
                    errors: errors_tx.clone(),
                    metrics: Arc::clone(&metrics),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            pool = %config.name,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Started worker pool"
        );

        let pool = Self {
            config,
            input: Mutex::new(Some(input_tx)),
            outputs: Mutex::new(Some((results_tx, errors_tx))),
            handles: Mutex::new(handles),
            cancel,
            metrics,
        };
        let outputs = PoolOutputs {
            results: results_rx,
            errors: errors_rx,
        };
        (pool, outputs)
    }

    /// Queue an item, waiting while the queue is full
    pub async fn submit(&self, item: I) -> Result<(), WorkerPoolError> {
        self.submit_with(item, &Cancellation::new()).await
    }

    /// Queue an item, giving up if `cancel` fires while the queue is full
    pub async fn submit_with(&self, item: I, cancel: &Cancellation) -> Result<(), WorkerPoolError> {
        cancel.check()?;
        let sender = self.input.lock().clone().ok_or(WorkerPoolError::Closed)?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WorkerPoolError::Closed),
            reason = cancel.cancelled() => Err(reason.into()),
            sent = sender.send(item) => sent.map_err(|_| WorkerPoolError::Closed),
        }
    }

    /// Stop accepting items, let workers drain the queue, then shut down
    ///
    /// Queued items are still processed, so callers must keep draining
    /// [`PoolOutputs`] until close returns, or call [`cancel`](Self::cancel)
    /// first. Calling close again is a no-op.
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn close(&self) {
        drop(self.input.lock().take());

        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        info!(pool = %self.config.name, "Closing worker pool");

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(pool = %self.config.name, "Worker task failed: {}", e);
            }
        }

        self.cancel.cancel();
        drop(self.outputs.lock().take());
        info!(pool = %self.config.name, "Worker pool closed");
    }

    /// Stop immediately: queued items are dropped and in-flight deliveries
    /// abandoned
    ///
    /// Follow with [`close`](Self::close) to wait for workers to exit.
    pub fn cancel(&self) {
        info!(pool = %self.config.name, "Cancelling worker pool");
        drop(self.input.lock().take());
        self.cancel.cancel();
    }

    /// Whether the pool has stopped accepting items
    pub fn is_closed(&self) -> bool {
        self.input.lock().is_none()
    }

    pub fn metrics(&self) -> &Arc<M> {
        &self.metrics
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

impl<I, O, E, M> Drop for WorkerPool<I, O, E, M> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker<I, O, E, M> {
    id: usize,
    input: Arc<tokio::sync::Mutex<mpsc::Receiver<I>>>,
    job: Job<I, O, E>,
    results: mpsc::Sender<O>,
    errors: mpsc::Sender<E>,
    metrics: Arc<M>,
    cancel: CancellationToken,
}

impl<I, O, E, M> Worker<I, O, E, M>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
    M: MetricsSink + 'static,
{
    async fn run(self) {
        loop {
            let next = {
                let mut input = self.input.lock().await;
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    item = input.recv() => item,
                }
            };
            let Some(item) = next else {
                break;
            };

            let started = Instant::now();
            let outcome = (self.job)(item).await;
            self.metrics.record(started.elapsed(), outcome.is_ok());

            let delivered = match outcome {
                Ok(output) => deliver(&self.results, output, &self.cancel).await,
                Err(err) => deliver(&self.errors, err, &self.cancel).await,
            };
            if !delivered {
                debug!(worker = self.id, "Worker: shutdown during delivery");
                break;
            }
        }

        debug!(worker = self.id, "Worker exited");
    }
}

/// Send unless cancelled first; returns false on cancellation
///
/// A dropped receiver discards the value and keeps the worker running.
async fn deliver<T>(tx: &mpsc::Sender<T>, value: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tx.send(value) => true,
    }
}
