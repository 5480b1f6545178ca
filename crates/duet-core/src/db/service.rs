//! Shared control database service used by the engine, queue and ledger.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::{
    CursorRepository, Database, FailedBatch, OperationCount, SqliteBaselineRepository,
    SqliteConflictRepository,
    SqliteCursorRepository, SqliteFailedBatchRepository, SqliteLedgerRepository,
    SqliteOperationRepository,
};
use crate::error::Result;
use crate::models::{
    Conflict, Cursor, MigrationApplication, OfflineOperation, OperationKind, OperationStatus,
    Record, ResolutionStatus, StoreId, TenantId,
};

/// Bookkeeping written once both stores accepted a batch
#[derive(Debug, Clone, Default)]
pub struct CommittedBatch {
    pub primary_version: u64,
    pub secondary_version: u64,
    /// Conflicts detected while building the batch
    pub conflicts: Vec<Conflict>,
    /// Manual resolutions whose winner was part of the batch
    pub applied_resolutions: Vec<i64>,
    /// (primary key, checksum) pairs both stores now agree on
    pub baselines: Vec<(String, String)>,
}

/// Thread-safe handle to the control database.
#[derive(Clone)]
pub struct ControlDb {
    db: Arc<Mutex<Database>>,
    path: Option<PathBuf>,
}

impl ControlDb {
    /// Open the control database at the given filesystem path.
    pub fn open_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let db = Database::open(&path)?;
        tracing::debug!("Opened control database at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: Some(path),
        })
    }

    /// Open an in-memory control database (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // Cursors

    pub async fn cursor(&self, tenant: &TenantId, table: &str, store: StoreId) -> Result<Cursor> {
        let db = self.db.lock().await;
        SqliteCursorRepository::new(db.connection()).get(tenant, table, store)
    }

    pub async fn cursors(&self, tenant: &TenantId) -> Result<Vec<Cursor>> {
        let db = self.db.lock().await;
        SqliteCursorRepository::new(db.connection()).list(tenant)
    }

    /// Advance both cursors and persist the batch's conflicts and baselines in one transaction
    pub async fn record_committed_batch(
        &self,
        tenant: &TenantId,
        table: &str,
        batch: &CommittedBatch,
        at: i64,
    ) -> Result<Vec<i64>> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let ids = {
            let cursors = SqliteCursorRepository::new(&tx);
            cursors.advance(tenant, table, StoreId::Primary, batch.primary_version, at)?;
            cursors.advance(tenant, table, StoreId::Secondary, batch.secondary_version, at)?;

            let conflicts = SqliteConflictRepository::new(&tx);
            let ids = batch
                .conflicts
                .iter()
                .map(|conflict| conflicts.insert(conflict))
                .collect::<Result<Vec<_>>>()?;
            for id in &batch.applied_resolutions {
                conflicts.mark_applied(*id, at)?;
            }

            let baselines = SqliteBaselineRepository::new(&tx);
            for (primary_key, checksum) in &batch.baselines {
                baselines.upsert(tenant, table, primary_key, checksum, at)?;
            }
            ids
        };
        tx.commit()?;
        Ok(ids)
    }

    pub async fn baselines(
        &self,
        tenant: &TenantId,
        table: &str,
        primary_keys: &[String],
    ) -> Result<HashMap<String, String>> {
        if primary_keys.is_empty() {
            return Ok(HashMap::new());
        }
        let db = self.db.lock().await;
        SqliteBaselineRepository::new(db.connection()).get_many(tenant, table, primary_keys)
    }

    // Conflicts

    pub async fn record_conflict(&self, conflict: &Conflict) -> Result<i64> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).insert(conflict)
    }

    pub async fn conflict(&self, tenant: &TenantId, id: i64) -> Result<Option<Conflict>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).get(tenant, id)
    }

    pub async fn conflicts(
        &self,
        tenant: &TenantId,
        status: Option<ResolutionStatus>,
        limit: usize,
    ) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).list(tenant, status, limit)
    }

    pub async fn frozen_keys(&self, tenant: &TenantId, table: &str) -> Result<HashSet<String>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).frozen_keys(tenant, table)
    }

    pub async fn awaiting_apply(&self, tenant: &TenantId, table: &str) -> Result<Vec<Conflict>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).awaiting_apply(tenant, table)
    }

    /// Store the operator's choice and supersede queued writes for the key
    pub async fn resolve_conflict(
        &self,
        conflict: &Conflict,
        winner: Option<StoreId>,
        resolved: &Record,
        at: i64,
    ) -> Result<bool> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let changed = SqliteConflictRepository::new(&tx).mark_resolved(
            &conflict.tenant,
            conflict.id,
            winner,
            resolved,
            at,
        )?;
        if changed {
            let superseded = SqliteOperationRepository::new(&tx).fail_pending_for_key(
                &conflict.tenant,
                &conflict.table,
                &conflict.primary_key,
                "superseded by manual resolution",
            )?;
            if superseded > 0 {
                tracing::info!(
                    tenant = %conflict.tenant,
                    table = %conflict.table,
                    primary_key = %conflict.primary_key,
                    superseded,
                    "Queued operations superseded by manual resolution"
                );
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    pub async fn conflict_counts(&self, tenant: &TenantId) -> Result<BTreeMap<String, u64>> {
        let db = self.db.lock().await;
        SqliteConflictRepository::new(db.connection()).count_by_status(tenant)
    }

    // Offline operations

    pub async fn enqueue(
        &self,
        op: OperationKind,
        payload: &Record,
        base_checksum: Option<&str>,
        created_at: i64,
    ) -> Result<OfflineOperation> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        let queued =
            SqliteOperationRepository::new(&tx).enqueue(op, payload, base_checksum, created_at)?;
        tx.commit()?;
        Ok(queued)
    }

    pub async fn pending_operations(&self, tenant: Option<&TenantId>) -> Result<Vec<OfflineOperation>> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).pending(tenant)
    }

    pub async fn max_applied_sequence(&self, tenant: &TenantId, table: &str) -> Result<i64> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).max_applied_sequence(tenant, table)
    }

    pub async fn mark_operation_applied(&self, id: i64, attempts: u32, at: i64) -> Result<()> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).mark_applied(id, attempts, at)
    }

    /// Fail an operation and open a manual conflict for its key, atomically
    pub async fn escalate_operation(
        &self,
        operation: &OfflineOperation,
        attempts: u32,
        error: &str,
        conflict: &Conflict,
    ) -> Result<i64> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        SqliteOperationRepository::new(&tx).mark_failed(operation.id, attempts, error)?;
        let id = SqliteConflictRepository::new(&tx).insert(conflict)?;
        tx.commit()?;
        Ok(id)
    }

    /// Mark a replayed operation applied together with the conflict its
    /// replay settled and, when both stores now agree, the key's baseline
    pub async fn settle_replay(
        &self,
        operation: &OfflineOperation,
        attempts: u32,
        conflict: &Conflict,
        baseline: Option<&str>,
        at: i64,
    ) -> Result<i64> {
        let mut db = self.db.lock().await;
        let tx = db.connection_mut().transaction()?;
        SqliteOperationRepository::new(&tx).mark_applied(operation.id, attempts, at)?;
        let id = SqliteConflictRepository::new(&tx).insert(conflict)?;
        if let Some(checksum) = baseline {
            SqliteBaselineRepository::new(&tx).upsert(
                &operation.tenant,
                &operation.table,
                &operation.primary_key,
                checksum,
                at,
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    pub async fn operations(
        &self,
        tenant: &TenantId,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).list(tenant, status, limit)
    }

    pub async fn operation_stats(&self, tenant: &TenantId) -> Result<Vec<OperationCount>> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).stats(tenant)
    }

    pub async fn count_pending_operations(&self, tenant: &TenantId) -> Result<u64> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).count_pending(tenant)
    }

    pub async fn clear_operations(&self, tenant: &TenantId, table: Option<&str>) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).clear(tenant, table)
    }

    pub async fn purge_applied_operations(&self, before: i64) -> Result<usize> {
        let db = self.db.lock().await;
        SqliteOperationRepository::new(db.connection()).purge_applied(before)
    }

    // Failed batches

    pub async fn record_failed_batch(&self, batch: &FailedBatch) -> Result<i64> {
        let db = self.db.lock().await;
        SqliteFailedBatchRepository::new(db.connection()).record(batch)
    }

    pub async fn failed_batches(&self, tenant: &TenantId, limit: usize) -> Result<Vec<FailedBatch>> {
        let db = self.db.lock().await;
        SqliteFailedBatchRepository::new(db.connection()).list(tenant, limit)
    }

    // Migration ledger

    pub async fn applications(&self, store: StoreId) -> Result<Vec<MigrationApplication>> {
        let db = self.db.lock().await;
        SqliteLedgerRepository::new(db.connection()).applications(store)
    }

    pub async fn record_application(&self, application: &MigrationApplication) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLedgerRepository::new(db.connection()).record(application)
    }

    pub async fn remove_application(&self, store: StoreId, version: u32) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLedgerRepository::new(db.connection()).remove(store, version)
    }

    pub async fn halt_migrations(&self, store: StoreId, reason: &str, at: i64) -> Result<()> {
        let db = self.db.lock().await;
        SqliteLedgerRepository::new(db.connection()).halt(store, reason, at)
    }

    pub async fn halt_reason(&self, store: StoreId) -> Result<Option<String>> {
        let db = self.db.lock().await;
        SqliteLedgerRepository::new(db.connection()).halt_reason(store)
    }

    pub async fn clear_halt(&self, store: StoreId) -> Result<bool> {
        let db = self.db.lock().await;
        SqliteLedgerRepository::new(db.connection()).clear_halt(store)
    }
}
