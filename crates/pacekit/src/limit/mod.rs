//! Admission control
//!
//! This module provides:
//! - [`TokenBucket`] - Rate limiting with bursts
//! - [`ResourceLimiter`] - Cap on concurrently held units

mod rate_limiter;
mod resource;

pub use rate_limiter::{RateLimitConfig, TokenBucket};
pub use resource::{ResourceLimiter, ResourceLimiterConfig, SlotGuard};
