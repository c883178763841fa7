//! Counting resource limiter
//!
//! Caps how many units of a resource (connections, file handles, in-flight
//! requests) are held at once. Unlike a bare semaphore it tolerates a release
//! with no matching acquire: the extra release is ignored and reported once.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::cancel::{CancelError, Cancellation};
use crate::warn_once::WarnOnce;

static UNMATCHED_RELEASE: WarnOnce = WarnOnce::new();

/// Resource limiter configuration
///
/// # Example
///
/// ```
/// use pacekit::ResourceLimiterConfig;
///
/// let config = ResourceLimiterConfig::new().with_capacity(64);
/// assert_eq!(config.capacity, 64);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimiterConfig {
    /// Maximum units held concurrently
    pub capacity: usize,
}

impl Default for ResourceLimiterConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

impl ResourceLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity (minimum 1)
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

/// Bounded counter of held resource units
///
/// `current_count()` always stays within `[0, capacity]`.
#[derive(Debug)]
pub struct ResourceLimiter {
    capacity: usize,
    current: AtomicUsize,
    slots: Semaphore,
}

impl ResourceLimiter {
    pub fn new(config: ResourceLimiterConfig) -> Self {
        Self::with_capacity(config.capacity)
    }

    /// Create a limiter for `capacity` units (minimum 1)
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            capacity,
            current: AtomicUsize::new(0),
            slots: Semaphore::new(capacity),
        }
    }

    /// Wait for a free unit or until `cancel` fires
    ///
    /// A cancelled acquire holds nothing afterwards.
    pub async fn acquire(&self, cancel: &Cancellation) -> Result<(), CancelError> {
        cancel.check()?;
        let permit = tokio::select! {
            biased;
            reason = cancel.cancelled() => return Err(reason),
            permit = self.slots.acquire() => permit,
        };
        // The semaphore is never closed
        let permit = permit.map_err(|_| CancelError::Cancelled)?;
        permit.forget();
        self.current.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Take a unit if one is free right now
    pub fn try_acquire(&self) -> bool {
        match self.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.current.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Acquire a unit that is released when the guard drops
    pub async fn acquire_guard(&self, cancel: &Cancellation) -> Result<SlotGuard<'_>, CancelError> {
        self.acquire(cancel).await?;
        Ok(SlotGuard { limiter: self })
    }

    /// Return a unit
    ///
    /// Releasing with nothing held is a no-op, logged once per process.
    pub fn release(&self) {
        let released = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(1))
            .is_ok();

        if released {
            self.slots.add_permits(1);
        } else {
            UNMATCHED_RELEASE.warn("resource limiter released more units than were acquired; ignoring");
        }
    }

    /// Units currently held
    pub fn current_count(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Units that could be acquired without waiting
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.current_count())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A held unit, released on drop
#[derive(Debug)]
pub struct SlotGuard<'a> {
    limiter: &'a ResourceLimiter,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
