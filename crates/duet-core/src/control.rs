//! Control surface consumed by the API layer and the CLI

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::db::{FailedBatch, OperationCount};
use crate::error::Result;
use crate::migrate::{LedgerStatus, MigrationCatalog, MigrationLedger, RollbackPlan};
use crate::models::{
    Choice, Conflict, Cursor, MigrationApplication, OfflineOperation, OperationStatus, RecordKey,
    ResolutionStatus, StoreId, TenantId,
};
use crate::offline::{ConnectivityMonitor, DrainReport, OfflineQueue, RoutedWrite, WriteRouter};
use crate::state::Connectivity;
use crate::sync::{PassReport, PurgeReport, SyncEngine, SyncMetricsSnapshot, SyncWorker, WorkerHandle};

const RECENT_FAILED_BATCHES: usize = 20;

/// Point-in-time view of a tenant's sync state
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub tenant: TenantId,
    pub connectivity: Connectivity,
    pub pass_in_progress: bool,
    pub cursors: Vec<Cursor>,
    pub last_pass: Option<PassReport>,
    /// Conflict counts keyed by resolution status
    pub conflicts: BTreeMap<String, u64>,
    pub queue_backlog: u64,
    pub failed_batches: Vec<FailedBatch>,
    pub metrics: SyncMetricsSnapshot,
}

/// Every operator-facing operation over one engine instance.
pub struct ControlSurface {
    engine: Arc<SyncEngine>,
    queue: OfflineQueue,
    router: WriteRouter,
    ledger: MigrationLedger,
    monitor: Arc<ConnectivityMonitor>,
    worker: Option<WorkerHandle>,
}

impl ControlSurface {
    pub fn new(engine: Arc<SyncEngine>, catalog: MigrationCatalog) -> Self {
        let monitor = Arc::new(ConnectivityMonitor::new(Arc::clone(engine.primary())));
        let ledger = MigrationLedger::new(
            catalog,
            engine.control().clone(),
            Arc::clone(engine.locks()),
            Arc::clone(engine.primary()),
            Arc::clone(engine.secondary()),
        );
        Self {
            queue: OfflineQueue::new(&engine),
            router: WriteRouter::new(&engine, Arc::clone(&monitor)),
            ledger,
            monitor,
            worker: None,
            engine,
        }
    }

    /// Start background tasks; later sync requests go through the worker
    pub fn start_worker(&mut self) -> JoinHandle<()> {
        let worker = SyncWorker::new(
            Arc::clone(&self.engine),
            self.queue.clone(),
            Arc::clone(&self.monitor),
        );
        let (handle, task) = worker.spawn();
        self.worker = Some(handle);
        task
    }

    pub async fn stop_worker(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    pub const fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub const fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    // Sync

    /// Run a pass for a tenant now, waiting behind any pass already running
    pub async fn trigger_sync(&self, tenant: &TenantId) -> Result<PassReport> {
        match &self.worker {
            Some(worker) => worker.sync_tenant(tenant.clone()).await,
            None => self.engine.sync_tenant(tenant).await,
        }
    }

    pub async fn sync_all(&self) -> Result<Vec<PassReport>> {
        self.engine.sync_all().await
    }

    /// Lock-free status read; values may be slightly stale
    pub async fn status(&self, tenant: &TenantId) -> Result<SyncStatus> {
        let control = self.engine.control();
        Ok(SyncStatus {
            tenant: tenant.clone(),
            connectivity: self.monitor.current(),
            pass_in_progress: self.engine.locks().pass_in_progress(tenant),
            cursors: self.engine.tracker().cursors(tenant).await?,
            last_pass: self.engine.last_report(tenant),
            conflicts: control.conflict_counts(tenant).await?,
            queue_backlog: self.queue.pending_count(tenant).await?,
            failed_batches: control.failed_batches(tenant, RECENT_FAILED_BATCHES).await?,
            metrics: self.engine.metrics().snapshot(),
        })
    }

    pub async fn refresh_connectivity(&self) -> Connectivity {
        self.monitor.probe().await;
        self.monitor.current()
    }

    // Conflicts

    pub async fn conflicts(
        &self,
        tenant: &TenantId,
        status: Option<ResolutionStatus>,
        limit: usize,
    ) -> Result<Vec<Conflict>> {
        self.engine.control().conflicts(tenant, status, limit).await
    }

    pub async fn resolve_conflict(&self, tenant: &TenantId, id: i64, choice: Choice) -> Result<Conflict> {
        self.engine.resolve_conflict(tenant, id, choice).await
    }

    // Writes

    pub async fn insert(&self, key: &RecordKey, fields: Map<String, Value>) -> Result<RoutedWrite> {
        self.router.insert(key, fields).await
    }

    pub async fn update(&self, key: &RecordKey, fields: Map<String, Value>) -> Result<RoutedWrite> {
        self.router.update(key, fields).await
    }

    pub async fn delete(&self, key: &RecordKey) -> Result<RoutedWrite> {
        self.router.delete(key).await
    }

    // Offline queue

    pub async fn queue_backlog(
        &self,
        tenant: &TenantId,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        self.queue.backlog(tenant, status, limit).await
    }

    pub async fn queue_stats(&self, tenant: &TenantId) -> Result<Vec<OperationCount>> {
        self.queue.stats(tenant).await
    }

    pub async fn clear_queue(&self, tenant: &TenantId, table: Option<&str>) -> Result<usize> {
        self.queue.clear(tenant, table).await
    }

    pub async fn drain_queue(&self, tenant: Option<&TenantId>) -> Result<DrainReport> {
        self.queue.drain(tenant).await
    }

    // Migrations

    pub async fn migration_status(&self) -> Result<Vec<LedgerStatus>> {
        let mut statuses = Vec::with_capacity(StoreId::ALL.len());
        for store in StoreId::ALL {
            statuses.push(self.ledger.status(store).await?);
        }
        Ok(statuses)
    }

    pub async fn migrate_up(
        &self,
        store: StoreId,
        target: Option<u32>,
    ) -> Result<Vec<MigrationApplication>> {
        self.ledger.apply_forward(store, target).await
    }

    pub async fn rollback_plan(&self, store: StoreId, target: u32) -> Result<RollbackPlan> {
        self.ledger.rollback_plan(store, target).await
    }

    pub async fn rollback(
        &self,
        store: StoreId,
        target: u32,
        accept_destructive: bool,
    ) -> Result<RollbackPlan> {
        self.ledger.rollback(store, target, accept_destructive).await
    }

    pub async fn clear_migration_halt(&self, store: StoreId) -> Result<bool> {
        self.ledger.clear_halt(store).await
    }

    // Retention

    pub async fn purge(&self) -> Result<PurgeReport> {
        self.engine
            .purge_expired(self.engine.settings().retention)
            .await
    }
}
