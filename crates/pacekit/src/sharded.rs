//! Sharded concurrent map
//!
//! Keys are spread over a power-of-two number of independently locked
//! shards, so writers to different keys rarely contend. Shard selection is a
//! bitmask over the key's hash.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use parking_lot::RwLock;

/// Shard count used by [`ShardedMap::new`]
pub const DEFAULT_SHARDS: usize = 32;

/// Fewer shards than this are rounded up
pub const MIN_SHARDS: usize = 32;

/// More shards than this are clamped
pub const MAX_SHARDS: usize = 1 << 16;

/// Concurrent hash map split across locked shards
///
/// Single-key operations are linearizable. [`len`](Self::len) and
/// [`keys`](Self::keys) visit shards one at a time and may miss concurrent
/// changes.
///
/// # Example
///
/// ```
/// use pacekit::ShardedMap;
///
/// let hosts: ShardedMap<String, u32> = ShardedMap::new();
/// hosts.set("example.com".to_string(), 3);
/// assert_eq!(hosts.get("example.com"), Some(3));
/// assert_eq!(hosts.len(), 1);
/// ```
pub struct ShardedMap<K, V, S = RandomState> {
    shards: Box<[RwLock<HashMap<K, V>>]>,
    mask: usize,
    hasher: S,
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create a map with at least `shards` shards (rounded to a power of two)
    pub fn with_shards(shards: usize) -> Self {
        Self::with_shards_and_hasher(shards, RandomState::new())
    }
}

impl<K, V> Default for ShardedMap<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ShardedMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Create a map using `hasher` for shard selection
    pub fn with_shards_and_hasher(shards: usize, hasher: S) -> Self {
        let count = shards.clamp(MIN_SHARDS, MAX_SHARDS).next_power_of_two();
        let shards = (0..count).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            mask: count - 1,
            hasher,
        }
    }

    fn shard<Q>(&self, key: &Q) -> &RwLock<HashMap<K, V>>
    where
        Q: Hash + ?Sized,
    {
        let index = (self.hasher.hash_one(key) as usize) & self.mask;
        &self.shards[index]
    }

    /// Insert or replace, returning the previous value
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    /// Copy of the value for `key`
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shard(key).read().get(key).cloned()
    }

    /// Run `f` against the value without cloning it
    pub fn with<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).read().get(key).map(f)
    }

    /// Remove `key`, returning its value
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).write().remove(key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).read().contains_key(key)
    }

    /// Value for `key`, inserting `make()` first if absent
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V
    where
        V: Clone,
    {
        let shard = self.shard(&key);
        if let Some(value) = shard.read().get(&key) {
            return value.clone();
        }
        shard.write().entry(key).or_insert_with(make).clone()
    }

    /// Mutate the value for `key` in place
    pub fn update<Q, R>(&self, key: &Q, f: impl FnOnce(&mut V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).write().get_mut(key).map(f)
    }

    /// Entry count summed shard by shard
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Snapshot of keys, collected shard by shard
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        let mut keys = Vec::new();
        for shard in self.shards.iter() {
            keys.extend(shard.read().keys().cloned());
        }
        keys
    }

    /// Remove every entry
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl<K, V, S> fmt::Debug for ShardedMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shards", &self.shard_count())
            .field("len", &self.len())
            .finish()
    }
}
