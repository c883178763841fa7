//! Time sources
//!
//! Components that reason about elapsed time take an `Arc<dyn Clock>` so tests
//! can drive time by hand, including moving it backwards.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A source of monotonic-looking instants
///
/// Implementations are not required to be monotonic. Consumers must tolerate
/// `now()` returning an instant earlier than one previously observed.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant
    fn now(&self) -> Instant;
}

/// Clock backed by tokio's time source
///
/// Outside a paused tokio runtime this is `Instant::now()`. Inside one it
/// follows the paused clock, so `#[tokio::test(start_paused = true)]` tests
/// advance it through sleeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Hand-driven clock for tests and simulations
///
/// Clones share the same current instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

/// Headroom so `rewind` never underflows the platform's instant origin
const REWIND_HEADROOM: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Create a clock frozen at an arbitrary starting instant
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now() + REWIND_HEADROOM)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Move the clock backward, simulating a wall-clock step
    pub fn rewind(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Some(earlier) = now.checked_sub(by) {
            *now = earlier;
        }
    }

    /// Jump to a specific instant
    pub fn set(&self, instant: Instant) {
        *self.now.lock() = instant;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}
