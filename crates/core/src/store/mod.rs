//! Shared state for workers
//!
//! - [`ShardedStore`] - Lock-partitioned key/value store for counters and caches
//! - [`ObjectPool`] - Recycles short-lived payload objects between jobs

mod object_pool;
mod sharded;

pub use object_pool::{ObjectPool, PoolStats, PooledObject, Reset};
pub use sharded::{DeterministicState, ShardStats, ShardedStore};
