//! Per-wallet mutual exclusion.
//!
//! One async mutex per distinct wallet address, created on first use and
//! kept for the lifetime of the registry. The set of addresses is bounded
//! by the queue size, so entries are never evicted.
//!
//! Groups lock their members in sorted, deduplicated order. Every call
//! site goes through [`ResourceLockRegistry::acquire_all`], so two groups
//! that share members can never wait on each other in a cycle.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::trace;

use crate::types::RunnerError;

type ResourceLock = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub struct ResourceLockRegistry {
    locks: Mutex<HashMap<String, ResourceLock>>,
}

/// Held lock on a single wallet. Released on drop.
pub struct ResourceGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl ResourceGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Held locks on every member of a group. All are released on drop.
pub struct GroupLockGuard {
    guards: Vec<ResourceGuard>,
}

impl GroupLockGuard {
    /// Locked keys in acquisition order.
    pub fn keys(&self) -> Vec<&str> {
        self.guards.iter().map(|g| g.key()).collect()
    }
}

impl ResourceLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the lock for `key`, creating it if this is the first reference.
    pub fn lock_for(&self, key: &str) -> ResourceLock {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(key) {
            return Arc::clone(lock);
        }
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(key.to_string(), Arc::clone(&lock));
        lock
    }

    /// Number of distinct keys seen so far.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    /// Whether `key` is currently locked by someone.
    pub fn is_held(&self, key: &str) -> bool {
        let lock = self.locks.lock().get(key).cloned();
        match lock {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }

    /// Lock a single wallet, optionally bounded by `timeout`.
    pub async fn acquire(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<ResourceGuard, RunnerError> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        self.acquire_before(key, deadline).await
    }

    /// Lock every key in canonical order.
    ///
    /// `timeout` bounds the whole acquisition. If any lock cannot be taken
    /// the ones already held are released before the error is returned.
    /// Dropping the returned future mid-acquisition releases them as well.
    pub async fn acquire_all<S: AsRef<str>>(
        &self,
        keys: &[S],
        timeout: Option<Duration>,
    ) -> Result<GroupLockGuard, RunnerError> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        let ordered = canonical_order(keys);
        let mut guards = Vec::with_capacity(ordered.len());

        for key in ordered {
            // On error `guards` is dropped here, releasing what was taken.
            guards.push(self.acquire_before(key, deadline).await?);
        }

        Ok(GroupLockGuard { guards })
    }

    async fn acquire_before(
        &self,
        key: &str,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<ResourceGuard, RunnerError> {
        let lock = self.lock_for(key);
        let guard = match deadline {
            None => lock.lock_owned().await,
            Some((at, waited)) => tokio::time::timeout_at(at, lock.lock_owned())
                .await
                .map_err(|_| RunnerError::ResourceContentionTimeout {
                    key: key.to_string(),
                    waited,
                })?,
        };
        trace!(key, "Resource locked");
        Ok(ResourceGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }
}

/// Sorted and deduplicated view of `keys`.
pub fn canonical_order<S: AsRef<str>>(keys: &[S]) -> Vec<&str> {
    let mut ordered: Vec<&str> = keys.iter().map(|k| k.as_ref()).collect();
    ordered.sort_unstable();
    ordered.dedup();
    ordered
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
