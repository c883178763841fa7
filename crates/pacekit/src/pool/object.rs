//! Generic object pool

use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Default cap on idle objects retained by a pool
pub const DEFAULT_MAX_IDLE: usize = 1024;

type Constructor<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Reuses objects to avoid repeated allocation
///
/// Objects returned with [`put`](Pool::put) are reset before being stored, so
/// [`get`](Pool::get) never hands out state left by a previous user.
///
/// # Example
///
/// ```
/// use pacekit::Pool;
///
/// let pool = Pool::new(String::new, String::clear);
///
/// let mut s = pool.get();
/// s.push_str("scratch");
/// pool.put(s);
///
/// assert_eq!(pool.get(), "");
/// ```
pub struct Pool<T> {
    idle: Mutex<Vec<T>>,
    constructor: Constructor<T>,
    reset: Reset<T>,
    max_idle: usize,
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}

impl<T> Pool<T> {
    /// Create a pool from a constructor and a reset hook
    pub fn new<C, R>(constructor: C, reset: R) -> Self
    where
        C: Fn() -> T + Send + Sync + 'static,
        R: Fn(&mut T) + Send + Sync + 'static,
    {
        Self {
            idle: Mutex::new(Vec::new()),
            constructor: Box::new(constructor),
            reset: Box::new(reset),
            max_idle: DEFAULT_MAX_IDLE,
        }
    }

    /// Cap the number of idle objects kept; extras are dropped on return
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Take an idle object, or construct one
    pub fn get(&self) -> T {
        let reused = self.idle.lock().pop();
        reused.unwrap_or_else(|| (self.constructor)())
    }

    /// Reset `object` and keep it for reuse
    pub fn put(&self, mut object: T) {
        (self.reset)(&mut object);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(object);
        }
    }

    /// Take an object that returns itself to the pool on drop
    pub fn checkout(&self) -> Pooled<'_, T> {
        Pooled {
            object: Some(self.get()),
            pool: self,
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle
    }
}

/// Object borrowed from a [`Pool`]
pub struct Pooled<'a, T> {
    object: Option<T>,
    pool: &'a Pool<T>,
}

impl<T> Pooled<'_, T> {
    /// Keep the object instead of returning it to the pool
    pub fn detach(mut self) -> T {
        self.object
            .take()
            .unwrap_or_else(|| (self.pool.constructor)())
    }
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `detach` and `drop` take the object, and both consume the guard
        match &self.object {
            Some(object) => object,
            None => unreachable!("pooled object already taken"),
        }
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.object {
            Some(object) => object,
            None => unreachable!("pooled object already taken"),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.object).finish()
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.pool.put(object);
        }
    }
}
