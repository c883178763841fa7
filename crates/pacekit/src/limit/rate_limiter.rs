//! Token-bucket rate limiting
//!
//! The bucket starts full and regains whole tokens at a fixed interval. It is
//! built to survive a misbehaving clock: a time source that jumps backwards
//! never produces negative elapsed time, and a token count that somehow leaves
//! `[0, max_tokens]` is repaired before the next decision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::cancel::{CancelError, Cancellation};
use crate::clock::{Clock, SystemClock};
use crate::config::{duration_millis, MIN_INTERVAL};

/// Blocking waits poll this many times per refill interval
const POLLS_PER_INTERVAL: u32 = 10;

/// Rate limiter configuration
///
/// # Example
///
/// ```
/// use pacekit::RateLimitConfig;
/// use std::time::Duration;
///
/// // Bursts of up to 20 requests, one new request every 50ms
/// let config = RateLimitConfig::new()
///     .with_max_tokens(20)
///     .with_refill_interval(Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity, which is also the largest possible burst
    pub max_tokens: u64,

    /// Time to regain one token
    #[serde(with = "duration_millis")]
    pub refill_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            refill_interval: Duration::from_millis(100),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bucket capacity (minimum 1)
    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    /// Set the refill interval (minimum 1ms)
    pub fn with_refill_interval(mut self, interval: Duration) -> Self {
        self.refill_interval = interval.max(MIN_INTERVAL);
        self
    }

    fn normalized(self) -> Self {
        Self {
            max_tokens: self.max_tokens.max(1),
            refill_interval: self.refill_interval.max(MIN_INTERVAL),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    /// Signed so a corrupted count below zero is observable and repairable
    tokens: i64,
    last_refill: Instant,
}

/// Thread-safe token bucket
///
/// Within `D` of its creation the bucket admits at most
/// `max_tokens + floor(D / refill_interval)` calls. Partial intervals are
/// discarded on each refill, never banked.
#[derive(Debug)]
pub struct TokenBucket {
    max_tokens: i64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a full bucket reading time from `clock`
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let config = config.normalized();
        let max_tokens = i64::try_from(config.max_tokens).unwrap_or(i64::MAX);
        Self {
            max_tokens,
            refill_interval: config.refill_interval,
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                last_refill: clock.now(),
            }),
            clock,
        }
    }

    /// Take one token if available; never blocks
    pub fn allow(&self) -> bool {
        // Time is read under the lock so readings follow refill order
        let mut state = self.state.lock();
        let now = self.clock.now();

        self.repair(&mut state);
        self.refill(&mut state, now);

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Block until a token is available or `cancel` fires
    ///
    /// A cancelled wait consumes nothing.
    pub async fn wait(&self, cancel: &Cancellation) -> Result<(), CancelError> {
        let poll = self.poll_interval();
        loop {
            cancel.check()?;
            if self.allow() {
                return Ok(());
            }
            tokio::select! {
                biased;
                reason = cancel.cancelled() => return Err(reason),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Block for at most `timeout` waiting for a token
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<(), CancelError> {
        self.wait(&Cancellation::with_timeout(timeout)).await
    }

    /// Tokens a call to [`allow`](Self::allow) could draw on right now
    pub fn available(&self) -> u64 {
        let state = self.state.lock();
        let now = self.clock.now();

        let tokens = state.tokens.clamp(0, self.max_tokens);
        let pending = now
            .checked_duration_since(state.last_refill)
            .map(|elapsed| self.intervals_in(elapsed))
            .unwrap_or(0);
        u64::try_from(tokens.saturating_add(pending).min(self.max_tokens)).unwrap_or(0)
    }

    pub fn max_tokens(&self) -> u64 {
        u64::try_from(self.max_tokens).unwrap_or(0)
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Sleep between polls in [`wait`](Self::wait)
    pub fn poll_interval(&self) -> Duration {
        (self.refill_interval / POLLS_PER_INTERVAL).max(MIN_INTERVAL)
    }

    fn repair(&self, state: &mut BucketState) {
        if state.tokens < 0 {
            error!(tokens = state.tokens, "token bucket count went negative, clamping to zero");
            state.tokens = 0;
        } else if state.tokens > self.max_tokens {
            warn!(
                tokens = state.tokens,
                max_tokens = self.max_tokens,
                "token bucket count exceeded capacity, clamping"
            );
            state.tokens = self.max_tokens;
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let Some(elapsed) = now.checked_duration_since(state.last_refill) else {
            warn!(
                skew_ms = state.last_refill.duration_since(now).as_millis() as u64,
                "clock moved backwards, resetting token bucket refill baseline"
            );
            state.last_refill = now;
            return;
        };

        if elapsed < self.refill_interval {
            return;
        }
        state.tokens = state
            .tokens
            .saturating_add(self.intervals_in(elapsed))
            .min(self.max_tokens);
        state.last_refill = now;
    }

    fn intervals_in(&self, elapsed: Duration) -> i64 {
        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
        i64::try_from(intervals).unwrap_or(i64::MAX)
    }

    #[cfg(test)]
    fn force_tokens(&self, tokens: i64) {
        self.state.lock().tokens = tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn manual_bucket(max_tokens: u64, interval_ms: u64) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::new();
        let config = RateLimitConfig::new()
            .with_max_tokens(max_tokens)
            .with_refill_interval(Duration::from_millis(interval_ms));
        (TokenBucket::with_clock(config, Arc::new(clock.clone())), clock)
    }

    fn drain(bucket: &TokenBucket) {
        while bucket.allow() {}
    }

    #[test]
    fn test_config_clamps() {
        let config = RateLimitConfig::new()
            .with_max_tokens(0)
            .with_refill_interval(Duration::ZERO);
        assert_eq!(config.max_tokens, 1);
        assert_eq!(config.refill_interval, Duration::from_millis(1));

        let raw = RateLimitConfig {
            max_tokens: 0,
            refill_interval: Duration::ZERO,
        };
        let bucket = TokenBucket::new(raw);
        assert_eq!(bucket.max_tokens(), 1);
        assert_eq!(bucket.refill_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_starts_full() {
        let (bucket, _clock) = manual_bucket(3, 100);
        assert_eq!(bucket.available(), 3);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
        assert_eq!(bucket.available(), 0);
    }

    #[test]
    fn test_refills_whole_intervals() {
        let (bucket, clock) = manual_bucket(5, 100);
        drain(&bucket);

        clock.advance(Duration::from_millis(99));
        assert!(!bucket.allow());

        clock.advance(Duration::from_millis(1));
        assert!(bucket.allow());
        assert!(!bucket.allow());

        clock.advance(Duration::from_millis(250));
        assert_eq!(bucket.available(), 2);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn test_refill_capped_at_max() {
        let (bucket, clock) = manual_bucket(4, 10);
        drain(&bucket);
        clock.advance(Duration::from_secs(3600));

        let granted = (0..100).filter(|_| bucket.allow()).count();
        assert_eq!(granted, 4);
    }

    #[test_log::test]
    fn test_backward_clock_jump_tolerated() {
        let (bucket, clock) = manual_bucket(2, 100);
        drain(&bucket);

        clock.rewind(Duration::from_secs(10));
        assert!(!bucket.allow());
        assert_eq!(bucket.available(), 0);

        // Baseline was reset to the rewound time, so one interval later refills
        clock.advance(Duration::from_millis(100));
        assert!(bucket.allow());
    }

    #[test_log::test]
    fn test_negative_count_repaired() {
        let (bucket, _clock) = manual_bucket(5, 100);
        bucket.force_tokens(-7);
        assert_eq!(bucket.available(), 0);
        assert!(!bucket.allow());
        assert_eq!(bucket.available(), 0);
    }

    #[test_log::test]
    fn test_overfull_count_repaired() {
        let (bucket, _clock) = manual_bucket(5, 100);
        bucket.force_tokens(50);
        assert!(bucket.allow());
        assert_eq!(bucket.available(), 4);
    }

    #[test]
    fn test_admissions_bounded_over_any_window() {
        let max_tokens = 5u64;
        let interval = Duration::from_millis(20);
        let (bucket, clock) = manual_bucket(max_tokens, 20);
        let start = clock.now();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        let mut admitted = Vec::new();
        for _ in 0..2_000 {
            clock.advance(Duration::from_millis(rng.gen_range(0..15)));
            if bucket.allow() {
                admitted.push(clock.now() - start);
            }
        }

        // Windows measured from creation
        for (j, elapsed) in admitted.iter().enumerate() {
            let count = (j + 1) as u128;
            let bound = u128::from(max_tokens) + elapsed.as_nanos() / interval.as_nanos();
            assert!(count <= bound, "{count} admissions by {elapsed:?} exceeds {bound}");
        }

        // Arbitrary windows may straddle one partially elapsed interval
        for (i, window_start) in admitted.iter().enumerate() {
            for (j, window_end) in admitted.iter().enumerate().skip(i) {
                let span = *window_end - *window_start;
                let count = (j - i + 1) as u128;
                let bound = u128::from(max_tokens) + span.as_nanos() / interval.as_nanos() + 1;
                assert!(count <= bound, "{count} admissions in {span:?} exceeds {bound}");
            }
        }
    }

    #[test]
    fn test_concurrent_allow_never_over_admits() {
        let config = RateLimitConfig::new()
            .with_max_tokens(100)
            .with_refill_interval(Duration::from_secs(3600));
        let bucket = Arc::new(TokenBucket::new(config));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| {
                            let granted = bucket.allow();
                            assert!(bucket.available() <= bucket.max_tokens());
                            granted
                        })
                        .count()
                })
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
    }

    /// Clock that holds one chosen thread inside `now()` until released or
    /// until a short timeout passes
    #[derive(Debug)]
    struct StallingClock {
        inner: ManualClock,
        stalled: Mutex<Option<std::thread::ThreadId>>,
        entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
        released: Mutex<bool>,
        wake: parking_lot::Condvar,
    }

    impl StallingClock {
        fn new(entered: std::sync::mpsc::Sender<()>) -> Self {
            Self {
                inner: ManualClock::new(),
                stalled: Mutex::new(None),
                entered: Mutex::new(Some(entered)),
                released: Mutex::new(false),
                wake: parking_lot::Condvar::new(),
            }
        }

        fn stall_current_thread(&self) {
            *self.stalled.lock() = Some(std::thread::current().id());
        }

        fn release(&self) {
            *self.released.lock() = true;
            self.wake.notify_all();
        }
    }

    impl Clock for StallingClock {
        fn now(&self) -> Instant {
            let now = self.inner.now();
            let is_stalled = {
                let mut stalled = self.stalled.lock();
                if *stalled == Some(std::thread::current().id()) {
                    *stalled = None;
                    true
                } else {
                    false
                }
            };

            if is_stalled {
                if let Some(entered) = self.entered.lock().take() {
                    let _ = entered.send(());
                }
                let mut released = self.released.lock();
                if !*released {
                    self.wake.wait_for(&mut released, Duration::from_millis(200));
                }
            }
            now
        }
    }

    #[test]
    fn test_delayed_reader_cannot_rewind_refill() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let clock = Arc::new(StallingClock::new(entered_tx));
        let config = RateLimitConfig::new()
            .with_max_tokens(1)
            .with_refill_interval(Duration::from_millis(100));
        let bucket = Arc::new(TokenBucket::with_clock(config, clock.clone()));

        let mut admitted = 0;
        assert!(bucket.allow());
        admitted += 1;

        // A second caller reads the time at t=0 and is held there
        let delayed = {
            let bucket = Arc::clone(&bucket);
            let clock = Arc::clone(&clock);
            std::thread::spawn(move || {
                clock.stall_current_thread();
                bucket.allow()
            })
        };
        entered_rx.recv().unwrap();

        clock.inner.advance(Duration::from_millis(100));
        admitted += usize::from(bucket.allow());
        clock.release();
        admitted += usize::from(delayed.join().unwrap());
        admitted += usize::from(bucket.allow());

        // One initial token plus one refill within 100ms
        assert_eq!(admitted, 2);
        assert_eq!(bucket.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_succeeds_after_refill() {
        let config = RateLimitConfig::new()
            .with_max_tokens(1)
            .with_refill_interval(Duration::from_millis(100));
        let bucket = TokenBucket::new(config);
        assert!(bucket.allow());

        let started = tokio::time::Instant::now();
        bucket.wait(&Cancellation::new()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_deadline_consumes_nothing() {
        let (bucket, clock) = manual_bucket(1, 1_000);
        drain(&bucket);

        let result = bucket.wait_timeout(Duration::from_millis(50)).await;
        assert_eq!(result, Err(CancelError::DeadlineExceeded));

        clock.advance(Duration::from_millis(1_000));
        assert_eq!(bucket.available(), 1);
    }

    #[tokio::test]
    async fn test_wait_already_cancelled() {
        let (bucket, _clock) = manual_bucket(3, 100);
        let cancel = Cancellation::new();
        cancel.cancel();

        assert_eq!(bucket.wait(&cancel).await, Err(CancelError::Cancelled));
        assert_eq!(bucket.available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_unbounded() {
        let (bucket, _clock) = manual_bucket(2, 100);
        assert_eq!(bucket.wait_timeout(Duration::MAX).await, Ok(()));
        assert_eq!(bucket.available(), 1);
    }

    #[test]
    fn test_poll_interval() {
        let (bucket, _clock) = manual_bucket(1, 100);
        assert_eq!(bucket.poll_interval(), Duration::from_millis(10));

        let (bucket, _clock) = manual_bucket(1, 5);
        assert_eq!(bucket.poll_interval(), Duration::from_millis(1));
    }
}
