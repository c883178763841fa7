//! Size-classed byte buffer pool

use tracing::trace;

use super::object::Pool;
use super::PoolError;

/// Smallest pooled buffer capacity (1 KiB)
pub const MIN_CLASS: usize = 1 << 10;

/// Largest pooled buffer capacity (1 MiB)
pub const MAX_CLASS: usize = 1 << 20;

const CLASS_COUNT: usize = (MAX_CLASS.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize + 1;

/// Pools byte buffers in power-of-two capacity classes from 1 KiB to 1 MiB
///
/// A request for `size` bytes is served from the smallest class that fits and
/// returned as a zeroed buffer of length `size`. Requests above 1 MiB are
/// allocated directly and never pooled.
///
/// # Example
///
/// ```
/// use pacekit::BufferPool;
///
/// let pool = BufferPool::new();
/// let buf = pool.get(1500).unwrap();
/// assert_eq!(buf.len(), 1500);
/// assert_eq!(buf.capacity(), 2048);
/// pool.put(buf);
/// ```
#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<Pool<Vec<u8>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        let classes = (0..CLASS_COUNT)
            .map(|i| {
                let class = MIN_CLASS << i;
                Pool::new(move || Vec::with_capacity(class), Vec::clear)
            })
            .collect();
        Self { classes }
    }

    /// Take a zeroed buffer of exactly `size` bytes
    pub fn get(&self, size: usize) -> Result<Vec<u8>, PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidSize(size));
        }

        match class_index(size) {
            Some(index) => {
                let mut buf = self.classes[index].get();
                buf.resize(size, 0);
                Ok(buf)
            }
            None => Ok(vec![0; size]),
        }
    }

    /// Return a buffer; buffers whose capacity is not a class size are dropped
    pub fn put(&self, buf: Vec<u8>) {
        let capacity = buf.capacity();
        match exact_class_index(capacity) {
            Some(index) => self.classes[index].put(buf),
            None => trace!(capacity, "dropping buffer outside pooled size classes"),
        }
    }

    /// Idle buffers held for the class serving `size`
    pub fn idle_count(&self, size: usize) -> usize {
        class_index(size)
            .map(|index| self.classes[index].idle_count())
            .unwrap_or(0)
    }
}

/// Capacity of the class that would serve `size`, or `None` if unpooled
pub fn size_class_for(size: usize) -> Option<usize> {
    class_index(size).map(|index| MIN_CLASS << index)
}

fn class_index(size: usize) -> Option<usize> {
    if size == 0 || size > MAX_CLASS {
        return None;
    }
    let class = size.max(MIN_CLASS).next_power_of_two();
    Some((class.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize)
}

fn exact_class_index(capacity: usize) -> Option<usize> {
    if capacity.is_power_of_two() && (MIN_CLASS..=MAX_CLASS).contains(&capacity) {
        class_index(capacity)
    } else {
        None
    }
}
