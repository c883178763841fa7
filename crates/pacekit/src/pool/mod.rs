//! Allocation reuse
//!
//! This module provides:
//! - [`Pool`] - Generic pool with constructor and reset hooks
//! - [`BufferPool`] - Byte buffers in power-of-two size classes

mod buffer;
mod object;

pub use buffer::{size_class_for, BufferPool, MAX_CLASS, MIN_CLASS};
pub use object::{Pool, Pooled, DEFAULT_MAX_IDLE};

/// Pool-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Requested a buffer of non-positive size
    #[error("invalid buffer size {0}: must be positive")]
    InvalidSize(usize),
}
