//! Lock-partitioned key/value store
//!
//! Keys are spread over a fixed power-of-two number of shards, each an
//! independent map behind its own `parking_lot::RwLock`. An operation locks
//! exactly one shard, so writers on different shards proceed in parallel.
//! No operation ever holds two shard locks at once.

use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;

/// Fixed-key SipHash: the same key maps to the same shard in every process
pub type DeterministicState = BuildHasherDefault<DefaultHasher>;

/// Per-shard occupancy and lock contention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShardStats {
    pub index: usize,
    pub len: usize,
    /// Acquisitions that found the lock held and had to wait
    pub contended: u64,
    /// Total time spent waiting on contended acquisitions
    pub wait_micros: u64,
}

struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
    contended: AtomicU64,
    wait_micros: AtomicU64,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            contended: AtomicU64::new(0),
            wait_micros: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        if let Some(guard) = self.map.try_read() {
            return guard;
        }
        let started = Instant::now();
        let guard = self.map.read();
        self.record_wait(started);
        guard
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        if let Some(guard) = self.map.try_write() {
            return guard;
        }
        let started = Instant::now();
        let guard = self.map.write();
        self.record_wait(started);
        guard
    }

    fn record_wait(&self, started: Instant) {
        self.contended.fetch_add(1, Ordering::Relaxed);
        self.wait_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    }
}

/// Concurrency-partitioned map shared by many workers
///
/// # Example
///
/// ```
/// use bulwark_core::ShardedStore;
///
/// let store: ShardedStore<String, u64> = ShardedStore::new(16);
/// store.set("reports:clinic-7".to_string(), 1);
/// store.update("reports:clinic-7".to_string(), |count| *count += 1);
///
/// assert_eq!(store.get("reports:clinic-7"), Some(2));
/// ```
pub struct ShardedStore<K, V, S = DeterministicState> {
    shards: Box<[Shard<K, V>]>,
    mask: usize,
    hasher: S,
}

impl<K, V> ShardedStore<K, V, DeterministicState>
where
    K: Hash + Eq,
{
    /// Create a store; `shard_count` is rounded up to a power of two
    pub fn new(shard_count: usize) -> Self {
        Self::with_hasher(shard_count, DeterministicState::default())
    }
}

impl<K, V, S> ShardedStore<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Create a store routing keys with `hasher`
    pub fn with_hasher(shard_count: usize, hasher: S) -> Self {
        let shard_count = shard_count.max(1).next_power_of_two();
        let shards = (0..shard_count).map(|_| Shard::new()).collect();
        Self {
            shards,
            mask: shard_count - 1,
            hasher,
        }
    }

    /// Shard a key routes to
    pub fn shard_index<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        (self.hasher.hash_one(key) as usize) & self.mask
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Clone of the value stored under `key`
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shard(key).read().get(key).cloned()
    }

    /// Read the value in place without cloning it
    pub fn get_with<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).read().get(key).map(f)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).read().contains_key(key)
    }

    /// Insert or replace, returning the previous value
    pub fn set(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    /// Remove, returning the value that was stored
    pub fn delete<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard(key).write().remove(key)
    }

    /// Atomic read-modify-write under the key's shard lock
    ///
    /// A missing entry starts from `V::default()`.
    pub fn update<R>(&self, key: K, f: impl FnOnce(&mut V) -> R) -> R
    where
        V: Default,
    {
        let mut shard = self.shard(&key).write();
        f(shard.entry(key).or_default())
    }

    /// Total number of entries
    ///
    /// Shards are visited one at a time, so the result is not a snapshot
    /// under concurrent writes.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    pub fn shard_lens(&self) -> Vec<usize> {
        self.shards.iter().map(|shard| shard.read().len()).collect()
    }

    pub fn shard_stats(&self) -> Vec<ShardStats> {
        self.shards
            .iter()
            .enumerate()
            .map(|(index, shard)| ShardStats {
                index,
                len: shard.read().len(),
                contended: shard.contended.load(Ordering::Relaxed),
                wait_micros: shard.wait_micros.load(Ordering::Relaxed),
            })
            .collect()
    }

    fn shard<Q>(&self, key: &Q) -> &Shard<K, V>
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        &self.shards[self.shard_index(key)]
    }
}
