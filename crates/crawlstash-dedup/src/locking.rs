//! Lock tables for per-identifier and per-content serialization.
//!
//! Each key maps to an async mutex. Guards are owned so they can be moved
//! into the blocking task that performs a write group. Acquisition is bounded
//! by a timeout; callers take several keys of one table through
//! [`LockTable::acquire_all`], which locks in sorted order.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::{StoreError, StoreResult};

/// Owned guard over one key of a [`LockTable`].
pub type LockGuard = OwnedMutexGuard<()>;

/// Table of async mutexes keyed by `K`.
#[derive(Debug)]
pub struct LockTable<K: Eq + Hash> {
    name: &'static str,
    locks: DashMap<K, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl<K> LockTable<K>
where
    K: Eq + Hash + Ord + Clone + Debug,
{
    /// Create a table whose acquisitions give up after `timeout`.
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            locks: DashMap::new(),
            timeout,
        }
    }

    fn slot(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    /// Lock `key`, failing with [`StoreError::LockTimeout`] after the timeout.
    pub async fn acquire(&self, key: &K) -> StoreResult<LockGuard> {
        let slot = self.slot(key);
        match tokio::time::timeout(self.timeout, slot.lock_owned()).await {
            Ok(guard) => {
                trace!(table = self.name, key = ?key, "Lock acquired");
                Ok(guard)
            }
            Err(_) => Err(StoreError::LockTimeout {
                resource: format!("{} {:?}", self.name, key),
                waited_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Lock every key in ascending order, skipping repeats. On failure the
    /// guards taken so far are released.
    pub async fn acquire_all(&self, keys: impl IntoIterator<Item = K>) -> StoreResult<Vec<LockGuard>> {
        let mut keys: Vec<K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.acquire(key).await?);
        }
        Ok(guards)
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - self.locks.len()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// True when no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
