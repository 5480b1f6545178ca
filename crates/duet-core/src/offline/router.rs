//! Routes application writes to whichever store is currently authoritative

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use super::ConnectivityMonitor;
use crate::db::ControlDb;
use crate::error::{Error, Result};
use crate::models::{OfflineOperation, OperationKind, Record, RecordKey, StoreId};
use crate::state::Connectivity;
use crate::store::StoreAdapter;
use crate::sync::{LockManager, SyncEngine, SyncMetrics};
use crate::util::now_millis;

/// Where a routed write landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutedWrite {
    pub record: Record,
    pub store: StoreId,
    /// Queue entry created when the write was redirected to the secondary
    pub queued: Option<OfflineOperation>,
}

pub struct WriteRouter {
    primary: Arc<dyn StoreAdapter>,
    secondary: Arc<dyn StoreAdapter>,
    control: ControlDb,
    locks: Arc<LockManager>,
    metrics: Arc<SyncMetrics>,
    monitor: Arc<ConnectivityMonitor>,
    offline_mode_enabled: bool,
}

impl WriteRouter {
    pub fn new(engine: &SyncEngine, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self {
            primary: Arc::clone(engine.primary()),
            secondary: Arc::clone(engine.secondary()),
            control: engine.control().clone(),
            locks: Arc::clone(engine.locks()),
            metrics: Arc::clone(engine.metrics()),
            monitor,
            offline_mode_enabled: engine.settings().offline_mode_enabled,
        }
    }

    pub async fn insert(&self, key: &RecordKey, fields: Map<String, Value>) -> Result<RoutedWrite> {
        self.route(key, OperationKind::Insert, Some(fields)).await
    }

    pub async fn update(&self, key: &RecordKey, fields: Map<String, Value>) -> Result<RoutedWrite> {
        self.route(key, OperationKind::Update, Some(fields)).await
    }

    /// Soft delete; `NotFound` when the target store has no such record
    pub async fn delete(&self, key: &RecordKey) -> Result<RoutedWrite> {
        self.route(key, OperationKind::Delete, None).await
    }

    async fn route(
        &self,
        key: &RecordKey,
        op: OperationKind,
        fields: Option<Map<String, Value>>,
    ) -> Result<RoutedWrite> {
        let _data = self.locks.data_access().await;
        let _shard = self.locks.shard(&key.tenant, &key.table).await;

        if self.monitor.current().primary_writable() {
            match apply(self.primary.as_ref(), key, fields.clone()).await {
                Ok(record) => {
                    return Ok(RoutedWrite {
                        record,
                        store: StoreId::Primary,
                        queued: None,
                    });
                }
                Err(error) if error.is_transient() && self.offline_mode_enabled => {
                    tracing::warn!(
                        tenant = %key.tenant,
                        table = %key.table,
                        error = %error,
                        "Primary write failed, redirecting to secondary"
                    );
                    self.monitor.observe(Connectivity::Offline);
                }
                Err(error) => return Err(error),
            }
        }

        if !self.offline_mode_enabled {
            return Err(Error::unavailable(
                StoreId::Primary,
                "primary store is unreachable and offline mode is disabled",
            ));
        }

        // Secondary write and enqueue share the shard lock, so sequence
        // numbers follow the order writes reached the secondary and each
        // base checksum is the copy the write replaced.
        let base = self.secondary.get(key).await?.map(|previous| previous.checksum);
        let record = apply(self.secondary.as_ref(), key, fields).await?;
        let queued = self
            .control
            .enqueue(op, &record, base.as_deref(), now_millis())
            .await?;
        self.metrics.record_operation_queued();
        tracing::debug!(
            tenant = %key.tenant,
            table = %key.table,
            primary_key = %key.primary_key,
            op = %op,
            sequence_no = queued.sequence_no,
            "Write queued for replay"
        );
        Ok(RoutedWrite {
            record,
            store: StoreId::Secondary,
            queued: Some(queued),
        })
    }
}

async fn apply(
    store: &dyn StoreAdapter,
    key: &RecordKey,
    fields: Option<Map<String, Value>>,
) -> Result<Record> {
    match fields {
        Some(fields) => store.write(key, fields).await,
        None => store
            .tombstone(key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{}/{}/{}", key.tenant, key.table, key.primary_key))),
    }
}
