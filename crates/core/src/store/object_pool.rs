//! Reusable-object pool
//!
//! Objects are reset before they go back on the free list, so a freshly
//! acquired object never carries data from the job that used it last. The
//! pool is best-effort: surplus objects are dropped and an empty pool simply
//! constructs a new one.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Return an object to its documented default state
///
/// `Default` doubles as the empty value left behind when an object is moved
/// out of its guard.
pub trait Reset: Default {
    fn reset(&mut self);
}

impl<T> Reset for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl Reset for String {
    fn reset(&mut self) {
        self.clear();
    }
}

impl<K, V, S: Default> Reset for HashMap<K, V, S> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Object pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub max_idle: usize,
    pub created: u64,
    pub reused: u64,
    pub discarded: u64,
    pub hit_rate: f64,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolInner<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    factory: Factory<T>,
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

impl<T: Reset> PoolInner<T> {
    fn take(&self) -> T {
        if let Some(object) = self.idle.lock().pop() {
            self.reused.fetch_add(1, Ordering::Relaxed);
            return object;
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        (self.factory)()
    }

    fn put(&self, mut object: T) {
        object.reset();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(object);
        } else {
            drop(idle);
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Thread-safe pool of reusable objects
///
/// Cloning the pool is cheap and shares the same free list.
///
/// # Example
///
/// ```
/// use bulwark_core::ObjectPool;
///
/// let pool: ObjectPool<Vec<u8>> = ObjectPool::new(32);
/// {
///     let mut buf = pool.acquire();
///     buf.extend_from_slice(b"report body");
///     // Reset and returned to the pool here
/// }
/// assert!(pool.acquire().is_empty());
/// ```
pub struct ObjectPool<T: Reset> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Reset> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Reset + 'static> ObjectPool<T> {
    /// Pool constructing new objects with `T::default()`
    pub fn new(max_idle: usize) -> Self {
        Self::with_factory(max_idle, T::default)
    }
}

impl<T: Reset> ObjectPool<T> {
    /// Pool constructing new objects with `factory`
    pub fn with_factory(max_idle: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(max_idle.min(1024))),
                max_idle,
                factory: Box::new(factory),
                created: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Borrow an object; it is reset and returned when the guard drops
    pub fn acquire(&self) -> PooledObject<T> {
        PooledObject {
            object: self.inner.take(),
            pool: Arc::clone(&self.inner),
            detached: false,
        }
    }

    /// Return an object detached with [`PooledObject::into_inner`]
    pub fn release(&self, object: T) {
        self.inner.put(object);
    }

    /// Fill the free list up to `count` objects (bounded by `max_idle`)
    pub fn prewarm(&self, count: usize) {
        let target = count.min(self.inner.max_idle);
        let mut idle = self.inner.idle.lock();
        while idle.len() < target {
            idle.push((self.inner.factory)());
            self.inner.created.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every idle object
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.inner.idle.lock());
        self.inner
            .discarded
            .fetch_add(dropped.len() as u64, Ordering::Relaxed);
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        let created = self.inner.created.load(Ordering::Relaxed);
        let reused = self.inner.reused.load(Ordering::Relaxed);
        PoolStats {
            idle: self.idle_count(),
            max_idle: self.inner.max_idle,
            created,
            reused,
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            hit_rate: if created + reused > 0 {
                reused as f64 / (created + reused) as f64
            } else {
                0.0
            },
        }
    }
}

/// RAII handle to a pooled object
pub struct PooledObject<T: Reset> {
    object: T,
    pool: Arc<PoolInner<T>>,
    detached: bool,
}

impl<T: Reset> PooledObject<T> {
    /// Keep the object; it will not return to the pool on drop
    pub fn into_inner(mut self) -> T {
        self.detached = true;
        std::mem::take(&mut self.object)
    }
}

impl<T: Reset> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

impl<T: Reset> DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.object
    }
}

impl<T: Reset> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if !self.detached {
            self.pool.put(std::mem::take(&mut self.object));
        }
    }
}
