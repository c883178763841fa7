//! End-to-end tests combining the primitives the way a fetcher would
//!
//! Run with: cargo test -p pacekit --test composition

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use pacekit::prelude::*;

/// Shared per-host state a fetch job consults
struct Upstream {
    bucket: TokenBucket,
    breaker: CircuitBreaker,
    connections: ResourceLimiter,
    calls: AtomicU32,
    healthy: bool,
}

impl Upstream {
    fn new(healthy: bool) -> Self {
        Self {
            bucket: TokenBucket::new(
                RateLimitConfig::new()
                    .with_max_tokens(20)
                    .with_refill_interval(Duration::from_millis(1)),
            ),
            breaker: CircuitBreaker::new(
                CircuitBreakerConfig::new()
                    .with_failure_threshold(3)
                    .with_reset_timeout(Duration::from_secs(3600)),
            ),
            connections: ResourceLimiter::with_capacity(2),
            calls: AtomicU32::new(0),
            healthy,
        }
    }

    async fn fetch(&self, id: u32) -> Result<String, String> {
        let cancel = Cancellation::with_timeout(Duration::from_secs(10));
        self.bucket.wait(&cancel).await.map_err(|e| e.to_string())?;
        let _slot = self
            .connections
            .acquire_guard(&cancel)
            .await
            .map_err(|e| e.to_string())?;
        assert!(self.connections.current_count() <= 2);

        self.breaker
            .execute(|| async {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                if self.healthy {
                    Ok(format!("page-{id}"))
                } else {
                    Err("503".to_string())
                }
            })
            .await
            .map_err(|e| e.to_string())
    }
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_pool_fetches_through_limits() {
    let upstream = Arc::new(Upstream::new(true));
    let config = WorkerPoolConfig::new()
        .with_name("fetchers")
        .with_workers(4)
        .with_queue_capacity(8)
        .with_output_capacity(64);

    let job_upstream = Arc::clone(&upstream);
    let (pool, outputs) = WorkerPool::start(config, move |id: u32| {
        let upstream = Arc::clone(&job_upstream);
        async move { upstream.fetch(id).await }
    });

    let PoolOutputs {
        mut results,
        mut errors,
    } = outputs;
    let pages = tokio::spawn(async move {
        let mut pages = Vec::new();
        while let Some(page) = results.recv().await {
            pages.push(page);
        }
        pages
    });

    for id in 0..50 {
        assert_ok!(pool.submit(id).await);
    }
    pool.close().await;

    let mut pages = pages.await.unwrap();
    pages.sort();
    assert_eq!(pages.len(), 50);
    assert!(pages.contains(&"page-0".to_string()));
    assert_eq!(errors.recv().await, None);

    assert_eq!(upstream.connections.current_count(), 0);
    assert_eq!(upstream.breaker.state(), CircuitState::Closed);
    assert_eq!(pool.metrics().snapshot().succeeded, 50);
}

#[test_log::test(tokio::test)]
async fn test_breaker_stops_calls_to_failing_upstream() {
    let upstream = Arc::new(Upstream::new(false));
    let config = WorkerPoolConfig::new().with_workers(1).with_output_capacity(64);

    let job_upstream = Arc::clone(&upstream);
    let (pool, mut outputs) = WorkerPool::start(config, move |id: u32| {
        let upstream = Arc::clone(&job_upstream);
        async move { upstream.fetch(id).await }
    });

    for id in 0..10 {
        assert_ok!(pool.submit(id).await);
    }
    pool.close().await;

    let mut failures = Vec::new();
    while let Some(err) = outputs.errors.recv().await {
        failures.push(err);
    }
    assert_eq!(failures.len(), 10);
    assert_eq!(
        failures.iter().filter(|e| e.contains("503")).count(),
        3,
        "only the calls before the circuit opened reach the upstream"
    );
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
    assert_eq!(upstream.breaker.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_retries_through_breaker_recovery() {
    let clock = ManualClock::new();
    let breaker = CircuitBreaker::with_clock(
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_reset_timeout(Duration::from_secs(1)),
        Arc::new(clock.clone()),
    );
    let mut backoff = Backoff::new(
        BackoffConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_multiplier(1.0)
            .with_jitter(false),
    );
    let attempts = AtomicU32::new(0);

    let result: Result<u32, RetryError<CircuitBreakerError<&str>>> = backoff
        .retry(6, &Cancellation::new(), || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            // Simulated time passes between attempts
            clock.advance(Duration::from_millis(600));
            breaker
                .execute(|| async move { if n <= 2 { Err("down") } else { Ok(n) } })
                .await
        })
        .await;

    // Attempts 1-2 fail and open the circuit, attempt 3 is rejected while open,
    // attempt 4 runs as the half-open trial and succeeds
    assert_eq!(assert_ok!(result), 4);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_config_drives_components() {
    let config = PacekitConfig::from_json(
        r#"{
            "rate_limit": { "max_tokens": 2, "refill_interval": 60000 },
            "resource_limiter": { "capacity": 1 },
            "map_shards": 100
        }"#,
    )
    .unwrap();

    let bucket = TokenBucket::new(config.rate_limit.clone());
    assert!(bucket.allow());
    assert!(bucket.allow());
    assert!(!bucket.allow());
    assert_err!(bucket.wait_timeout(Duration::from_millis(5)).await);

    let limiter = ResourceLimiter::new(config.resource_limiter.clone());
    assert!(limiter.try_acquire());
    assert!(!limiter.try_acquire());

    let map: ShardedMap<String, u32> = ShardedMap::with_shards(config.map_shards);
    assert_eq!(map.shard_count(), 128);
}

#[test]
fn test_buffer_and_object_pools_share_nothing() {
    let buffers = BufferPool::new();
    let scratch: Pool<Vec<u8>> = Pool::new(Vec::new, Vec::clear);

    let mut buf = buffers.get(2_000).unwrap();
    buf[0] = 1;
    let mut v = scratch.get();
    v.extend_from_slice(&buf[..4]);

    buffers.put(buf);
    scratch.put(v);

    assert!(buffers.get(2_000).unwrap().iter().all(|b| *b == 0));
    assert!(scratch.get().is_empty());
    assert_eq!(buffers.get(0), Err(PoolError::InvalidSize(0)));
}
