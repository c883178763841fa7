//! Process-wide one-shot warnings
//!
//! Some conditions are worth reporting once per process and would only be
//! noise afterwards. [`WarnOnce`] is meant to live in a `static`.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::warn;

/// A flag that lets a warning fire at most once
///
/// # Example
///
/// ```
/// use pacekit::WarnOnce;
///
/// static LEGACY_CONFIG: WarnOnce = WarnOnce::new();
///
/// assert!(LEGACY_CONFIG.warn("legacy config format detected"));
/// assert!(!LEGACY_CONFIG.warn("legacy config format detected"));
/// ```
#[derive(Debug)]
pub struct WarnOnce {
    fired: AtomicBool,
    lock: Mutex<()>,
}

impl Default for WarnOnce {
    fn default() -> Self {
        Self::new()
    }
}

impl WarnOnce {
    /// Create an unfired flag
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            lock: parking_lot::const_mutex(()),
        }
    }

    /// Whether the flag has already fired
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Run `f` if this is the first call; returns whether it ran
    pub fn call_once(&self, f: impl FnOnce()) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return false;
        }

        let _guard = self.lock.lock();
        if self.fired.load(Ordering::Relaxed) {
            return false;
        }
        f();
        self.fired.store(true, Ordering::Release);
        true
    }

    /// Emit `message` at warn level the first time only
    pub fn warn(&self, message: &str) -> bool {
        self.call_once(|| warn!("{message}"))
    }
}
