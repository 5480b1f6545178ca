//! Inter-task locking discipline.
//!
//! Acquisition order is always: tenant pass lock, then the global lock,
//! then shard locks. Migrations take the global lock exclusively; sync
//! batches, queue drains and routed writes take it shared.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::TenantId;

type LockMap<K> = StdMutex<HashMap<K, Arc<Mutex<()>>>>;

#[derive(Default)]
pub struct LockManager {
    global: RwLock<()>,
    shards: LockMap<(TenantId, String)>,
    passes: LockMap<TenantId>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for data movement
    pub async fn data_access(&self) -> RwLockReadGuard<'_, ()> {
        self.global.read().await
    }

    /// Exclusive access for schema changes; waits for in-flight batches
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.global.write().await
    }

    /// Per-(tenant, table) lock held by any batch or routed write on that shard
    pub async fn shard(&self, tenant: &TenantId, table: &str) -> OwnedMutexGuard<()> {
        let lock = entry(&self.shards, (tenant.clone(), table.to_string()));
        lock.lock_owned().await
    }

    /// Tenant pass lock; a second caller waits for the running pass
    pub async fn pass(&self, tenant: &TenantId) -> OwnedMutexGuard<()> {
        let lock = entry(&self.passes, tenant.clone());
        lock.lock_owned().await
    }

    /// Non-blocking check used by status reporting
    pub fn pass_in_progress(&self, tenant: &TenantId) -> bool {
        let passes = self.passes.lock().unwrap_or_else(PoisonError::into_inner);
        passes
            .get(tenant)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

fn entry<K: Eq + Hash>(map: &LockMap<K>, key: K) -> Arc<Mutex<()>> {
    let mut locks = map.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(key).or_default())
}
