//! Ordered replay of writes captured while the primary was unreachable

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::config::SyncSettings;
use crate::db::{ControlDb, OperationCount};
use crate::error::{Error, Result};
use crate::models::{
    Conflict, ConflictOrigin, ConflictStrategy, OfflineOperation, OperationStatus, Record,
    ResolutionStatus, StoreId, TenantId,
};
use crate::store::StoreAdapter;
use crate::sync::{
    materialize, resolve, retry_with_backoff, LockManager, Resolution, RetryOutcome, SyncEngine,
    SyncMetrics,
};
use crate::util::now_millis;

/// Replay outcome for one (tenant, table) partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub tenant: String,
    pub table: String,
    pub applied: usize,
    /// Operations whose content the primary already held
    pub already_applied: usize,
    /// Operations a sync pass had already reconciled past
    pub superseded: usize,
    /// Operations that met a newer primary edit and were settled by strategy
    pub resolved: usize,
    pub escalated: usize,
    /// Operations left pending behind a frozen key or an outage
    pub blocked: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub partitions: Vec<PartitionReport>,
}

impl DrainReport {
    pub fn applied(&self) -> usize {
        self.partitions
            .iter()
            .map(|partition| {
                partition.applied
                    + partition.already_applied
                    + partition.superseded
                    + partition.resolved
            })
            .sum()
    }

    pub fn escalated(&self) -> usize {
        self.partitions.iter().map(|partition| partition.escalated).sum()
    }
}

/// What replaying one operation does to the stores.
///
/// Decided from a read of both copies before anything is written, so a
/// retried write repeats the same decision.
enum Replayed {
    /// The primary still held the copy the offline write replaced
    Written(Record),
    AlreadyPresent,
    /// A sync pass already reconciled the key past this operation
    Superseded,
    /// The primary changed too; the strategy's winner goes to the primary,
    /// and to the secondary when no later offline write sits on top
    Resolved {
        winner: StoreId,
        stamped: Record,
        primary: Record,
        to_secondary: bool,
    },
    /// The primary changed too and an operator has to choose
    Diverged { primary: Record },
}

/// Offline operation queue backed by the control database.
#[derive(Clone)]
pub struct OfflineQueue {
    primary: Arc<dyn StoreAdapter>,
    secondary: Arc<dyn StoreAdapter>,
    control: ControlDb,
    locks: Arc<LockManager>,
    metrics: Arc<SyncMetrics>,
    settings: SyncSettings,
    draining: Arc<Mutex<()>>,
}

impl OfflineQueue {
    pub fn new(engine: &SyncEngine) -> Self {
        Self {
            primary: Arc::clone(engine.primary()),
            secondary: Arc::clone(engine.secondary()),
            control: engine.control().clone(),
            locks: Arc::clone(engine.locks()),
            metrics: Arc::clone(engine.metrics()),
            settings: engine.settings().clone(),
            draining: Arc::new(Mutex::new(())),
        }
    }

    /// Replay pending operations, optionally for one tenant only.
    ///
    /// Partitions drain concurrently; operations within a partition are
    /// applied one at a time in `sequence_no` order, under the partition's
    /// shard lock. An ordering violation
    /// aborts its partition and is returned once every partition finished.
    pub async fn drain(&self, tenant: Option<&TenantId>) -> Result<DrainReport> {
        let _draining = self.draining.lock().await;

        let mut partitions: BTreeMap<(TenantId, String), Vec<OfflineOperation>> = BTreeMap::new();
        for operation in self.control.pending_operations(tenant).await? {
            partitions
                .entry((operation.tenant.clone(), operation.table.clone()))
                .or_default()
                .push(operation);
        }
        if partitions.is_empty() {
            return Ok(DrainReport::default());
        }
        tracing::info!(partitions = partitions.len(), "Draining offline queue");

        let mut tasks = JoinSet::new();
        for ((tenant, table), operations) in partitions {
            let queue = self.clone();
            tasks.spawn(async move { queue.drain_partition(tenant, table, operations).await });
        }

        let mut report = DrainReport::default();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let (partition, result) = joined?;
            if let Err(error) = result {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            report.partitions.push(partition);
        }
        report
            .partitions
            .sort_by(|a, b| (&a.tenant, &a.table).cmp(&(&b.tenant, &b.table)));

        tracing::info!(
            applied = report.applied(),
            escalated = report.escalated(),
            "Offline queue drained"
        );
        match first_error {
            Some(error) => Err(error),
            None => Ok(report),
        }
    }

    async fn drain_partition(
        &self,
        tenant: TenantId,
        table: String,
        operations: Vec<OfflineOperation>,
    ) -> (PartitionReport, Result<()>) {
        let mut report = PartitionReport {
            tenant: tenant.to_string(),
            table: table.clone(),
            ..PartitionReport::default()
        };
        let result = self
            .replay_partition(&tenant, &table, &operations, &mut report)
            .await;
        if let Err(error) = &result {
            tracing::error!(
                tenant = %tenant,
                table = %table,
                error = %error,
                "Offline queue partition aborted"
            );
            report.error = Some(error.to_string());
        }
        (report, result)
    }

    async fn replay_partition(
        &self,
        tenant: &TenantId,
        table: &str,
        operations: &[OfflineOperation],
        report: &mut PartitionReport,
    ) -> Result<()> {
        // Held for the whole partition so a sync pass over the table sees
        // either none or all of the replayed writes.
        let _data = self.locks.data_access().await;
        let _shard = self.locks.shard(tenant, table).await;

        let mut frozen = self.control.frozen_keys(tenant, table).await?;
        let mut previous = self.control.max_applied_sequence(tenant, table).await?;
        let strategy = self.settings.strategy_for(tenant);

        for (index, operation) in operations.iter().enumerate() {
            if frozen.contains(&operation.primary_key) {
                report.blocked += 1;
                continue;
            }
            if operation.sequence_no <= previous {
                return Err(Error::OrderingViolation {
                    partition: operation.partition(),
                    previous,
                    found: operation.sequence_no,
                });
            }
            previous = operation.sequence_no;

            match self.replay(operation, strategy).await {
                RetryOutcome::Succeeded { value, attempts } => {
                    let attempts = operation.attempt_count + attempts;
                    if self.settle(operation, attempts, strategy, value, report).await? {
                        frozen.insert(operation.primary_key.clone());
                    }
                }
                RetryOutcome::Exhausted { attempts, error } => {
                    if self.primary.ping().await.is_err() {
                        tracing::warn!(
                            tenant = %tenant,
                            table,
                            error = %error,
                            "Primary unreachable, pausing replay"
                        );
                        report.blocked += operations.len() - index;
                        return Ok(());
                    }
                    let primary_copy = match self.primary.get(operation.key()).await {
                        Ok(copy) => copy,
                        Err(read_error) => {
                            tracing::warn!(
                                tenant = %tenant,
                                table,
                                primary_key = %operation.primary_key,
                                error = %read_error,
                                "Could not read primary copy for escalated operation"
                            );
                            None
                        }
                    };
                    let conflict = replay_conflict(
                        operation,
                        ConflictStrategy::Manual,
                        ConflictOrigin::ReplayExhausted,
                        primary_copy,
                    );
                    self.escalate(
                        operation,
                        operation.attempt_count + attempts,
                        &error.to_string(),
                        &conflict,
                    )
                    .await?;
                    frozen.insert(operation.primary_key.clone());
                    report.escalated += 1;
                }
            }
        }
        Ok(())
    }

    /// Decide, then write, each step retried on its own
    async fn replay(
        &self,
        operation: &OfflineOperation,
        strategy: ConflictStrategy,
    ) -> RetryOutcome<Replayed> {
        let retry = &self.settings.retry;
        let (decision, read_attempts) =
            match retry_with_backoff(retry, "read replay target", |_| self.decide(operation, strategy))
                .await
            {
                RetryOutcome::Succeeded { value, attempts } => (value, attempts),
                RetryOutcome::Exhausted { attempts, error } => {
                    return RetryOutcome::Exhausted { attempts, error };
                }
            };
        match retry_with_backoff(retry, "replay operation", |_| self.write(&decision)).await {
            RetryOutcome::Succeeded { attempts, .. } => RetryOutcome::Succeeded {
                value: decision,
                attempts: read_attempts.max(attempts),
            },
            RetryOutcome::Exhausted { attempts, error } => RetryOutcome::Exhausted {
                attempts: read_attempts.max(attempts),
                error,
            },
        }
    }

    async fn decide(&self, operation: &OfflineOperation, strategy: ConflictStrategy) -> Result<Replayed> {
        let payload = &operation.payload;
        let Some(current) = self.primary.get(operation.key()).await? else {
            return Ok(Replayed::Written(payload.clone()));
        };
        if current.converged_with(payload) {
            return Ok(Replayed::AlreadyPresent);
        }
        if operation.base_checksum.as_deref() == Some(current.checksum.as_str()) {
            return Ok(Replayed::Written(fast_forward(payload, &current)));
        }

        // A sync pass that already carried this content across leaves it
        // as the key's baseline; the primary has moved past it since.
        let baselines = self
            .control
            .baselines(
                &operation.tenant,
                &operation.table,
                std::slice::from_ref(&operation.primary_key),
            )
            .await?;
        if baselines.get(&operation.primary_key) == Some(&payload.checksum) {
            return Ok(Replayed::Superseded);
        }
        let secondary = self.secondary.get(operation.key()).await?;
        if secondary.as_ref().is_some_and(|copy| copy.converged_with(&current)) {
            return Ok(Replayed::Superseded);
        }
        let to_secondary = secondary.as_ref().is_some_and(|copy| copy.converged_with(payload));
        Ok(match resolve(strategy, &current, payload) {
            Resolution::Winner(winner) => {
                let stamped = match winner {
                    StoreId::Primary => materialize(&current, payload.version),
                    StoreId::Secondary => materialize(payload, current.version),
                };
                Replayed::Resolved {
                    winner,
                    stamped,
                    primary: current,
                    to_secondary,
                }
            }
            Resolution::Manual => Replayed::Diverged { primary: current },
        })
    }

    async fn write(&self, decision: &Replayed) -> Result<()> {
        match decision {
            Replayed::Written(record) => {
                self.primary.apply_batch(std::slice::from_ref(record)).await?;
            }
            Replayed::Resolved {
                stamped,
                to_secondary,
                ..
            } => {
                self.primary.apply_batch(std::slice::from_ref(stamped)).await?;
                if *to_secondary {
                    self.secondary.apply_batch(std::slice::from_ref(stamped)).await?;
                }
            }
            Replayed::AlreadyPresent | Replayed::Superseded | Replayed::Diverged { .. } => {}
        }
        Ok(())
    }

    /// Record what a replay did; `true` when the key is now frozen
    async fn settle(
        &self,
        operation: &OfflineOperation,
        attempts: u32,
        strategy: ConflictStrategy,
        replayed: Replayed,
        report: &mut PartitionReport,
    ) -> Result<bool> {
        let now = now_millis();
        match replayed {
            Replayed::Written(_) => {
                self.control.mark_operation_applied(operation.id, attempts, now).await?;
                report.applied += 1;
            }
            Replayed::AlreadyPresent => {
                self.control.mark_operation_applied(operation.id, attempts, now).await?;
                report.already_applied += 1;
            }
            Replayed::Superseded => {
                self.control.mark_operation_applied(operation.id, attempts, now).await?;
                report.superseded += 1;
            }
            Replayed::Resolved {
                winner,
                stamped,
                primary,
                to_secondary,
            } => {
                let baseline = to_secondary.then(|| stamped.checksum.clone());
                let conflict = Conflict {
                    winner: Some(winner),
                    resolution_status: ResolutionStatus::AutoResolved,
                    resolved_record: Some(stamped),
                    resolved_at: Some(now),
                    applied_at: Some(now),
                    ..replay_conflict(operation, strategy, ConflictOrigin::ReplayDiverged, Some(primary))
                };
                let conflict_id = self
                    .control
                    .settle_replay(operation, attempts, &conflict, baseline.as_deref(), now)
                    .await?;
                tracing::warn!(
                    tenant = %operation.tenant,
                    table = %operation.table,
                    primary_key = %operation.primary_key,
                    sequence_no = operation.sequence_no,
                    conflict_id,
                    strategy = %strategy,
                    winner = %winner,
                    "Queued write met a newer primary edit, auto-resolved"
                );
                report.resolved += 1;
            }
            Replayed::Diverged { primary } => {
                let conflict =
                    replay_conflict(operation, strategy, ConflictOrigin::ReplayDiverged, Some(primary));
                self.escalate(operation, attempts, "primary changed while queued", &conflict)
                    .await?;
                report.escalated += 1;
                return Ok(true);
            }
        }
        self.metrics.record_operation_replayed();
        Ok(false)
    }

    /// Fail the operation and open a manual conflict for its key
    async fn escalate(
        &self,
        operation: &OfflineOperation,
        attempts: u32,
        reason: &str,
        conflict: &Conflict,
    ) -> Result<()> {
        let conflict_id = self
            .control
            .escalate_operation(operation, attempts, reason, conflict)
            .await?;
        self.metrics.record_operation_escalated();
        tracing::error!(
            tenant = %operation.tenant,
            table = %operation.table,
            primary_key = %operation.primary_key,
            sequence_no = operation.sequence_no,
            conflict_id,
            origin = conflict.origin.as_str(),
            reason,
            "Offline operation escalated to manual review"
        );
        Ok(())
    }

    /// Queued operations of a tenant, optionally filtered by status
    pub async fn backlog(
        &self,
        tenant: &TenantId,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        self.control.operations(tenant, status, limit).await
    }

    pub async fn pending_count(&self, tenant: &TenantId) -> Result<u64> {
        self.control.count_pending_operations(tenant).await
    }

    pub async fn stats(&self, tenant: &TenantId) -> Result<Vec<OperationCount>> {
        self.control.operation_stats(tenant).await
    }

    /// Drop pending and failed operations of a tenant, optionally one table
    pub async fn clear(&self, tenant: &TenantId, table: Option<&str>) -> Result<usize> {
        let removed = self.control.clear_operations(tenant, table).await?;
        tracing::warn!(tenant = %tenant, table = ?table, removed, "Offline queue cleared");
        Ok(removed)
    }

    pub async fn purge_applied(&self, before: i64) -> Result<usize> {
        self.control.purge_applied_operations(before).await
    }

    /// Keys whose replay is blocked behind a pending manual conflict
    pub async fn blocked_keys(&self, tenant: &TenantId, table: &str) -> Result<HashSet<String>> {
        self.control.frozen_keys(tenant, table).await
    }
}

/// Payload stamped past the primary's version when the primary's clock
/// has already moved beyond it
fn fast_forward(payload: &Record, current: &Record) -> Record {
    if current.version >= payload.version {
        materialize(payload, current.version)
    } else {
        payload.clone()
    }
}

fn replay_conflict(
    operation: &OfflineOperation,
    strategy: ConflictStrategy,
    origin: ConflictOrigin,
    primary: Option<Record>,
) -> Conflict {
    Conflict {
        id: 0,
        tenant: operation.tenant.clone(),
        table: operation.table.clone(),
        primary_key: operation.primary_key.clone(),
        primary_version: primary.as_ref().map(|record| record.version),
        secondary_version: Some(operation.payload.version),
        detected_at: now_millis(),
        strategy_applied: strategy,
        origin,
        resolution_status: ResolutionStatus::PendingManual,
        winner: None,
        primary_record: primary,
        secondary_record: Some(operation.payload.clone()),
        resolved_record: None,
        resolved_at: None,
        applied_at: None,
    }
}
