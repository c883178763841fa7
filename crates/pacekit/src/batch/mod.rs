//! Adaptive batching
//!
//! [`AdaptiveBatchProcessor`] groups items into batches and tunes the batch
//! size so that each flush takes roughly the configured target latency.

mod processor;
mod window;

pub use processor::{AdaptiveBatchProcessor, BatchConfig, BatchError, BatchHandler, BatchStats};
