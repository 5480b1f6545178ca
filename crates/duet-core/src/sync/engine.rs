//! Sync engine: pulls deltas from both stores, resolves collisions and
//! commits each batch to both sides before advancing cursors.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::resolver::{materialize, resolve, Resolution};
use super::retry::{retry_with_backoff, RetryOutcome, RetryPolicy};
use super::{ChangeTracker, LockManager, PassReport, SyncMetrics, TableReport};
use crate::config::SyncSettings;
use crate::db::{CommittedBatch, ControlDb, FailedBatch};
use crate::error::{Error, Result};
use crate::models::{
    Choice, Conflict, ConflictOrigin, ConflictStrategy, Record, RecordKey, ResolutionStatus,
    StoreId, TenantId,
};
use crate::store::StoreAdapter;
use crate::util::{millis_before, now_millis};

/// Both deltas of one batch plus the other side's copies of one-sided keys
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub primary_changes: Vec<Record>,
    pub secondary_changes: Vec<Record>,
    /// Primary copies of keys the primary delta does not contain
    pub primary_current: HashMap<String, Record>,
    /// Secondary copies of keys the secondary delta does not contain
    pub secondary_current: HashMap<String, Record>,
}

impl Snapshot {
    fn current(&self, store: StoreId, primary_key: &str) -> Option<&Record> {
        let (changes, current) = match store {
            StoreId::Primary => (&self.primary_changes, &self.primary_current),
            StoreId::Secondary => (&self.secondary_changes, &self.secondary_current),
        };
        changes
            .iter()
            .find(|record| record.key.primary_key == primary_key)
            .or_else(|| current.get(primary_key))
    }
}

/// Everything `plan_batch` needs; no I/O happens past this point
pub(crate) struct PlanInput<'a> {
    pub tenant: &'a TenantId,
    pub table: &'a str,
    pub strategy: ConflictStrategy,
    /// Cursors the batch starts from, as (primary, secondary)
    pub cursors: (u64, u64),
    pub snapshot: &'a Snapshot,
    pub frozen: &'a HashSet<String>,
    /// Last synced checksum per primary key
    pub baselines: &'a HashMap<String, String>,
    /// Manual resolutions waiting to be written, ascending by id
    pub resolutions: &'a [Conflict],
    pub now: i64,
}

/// Writes and bookkeeping derived from one snapshot
#[derive(Debug, Clone, Default)]
pub(crate) struct BatchPlan {
    pub primary_writes: Vec<Record>,
    pub secondary_writes: Vec<Record>,
    pub conflicts: Vec<Conflict>,
    pub applied_resolutions: Vec<i64>,
    /// Checksum both stores hold once the batch commits, per primary key
    pub baselines: BTreeMap<String, String>,
    pub converged: usize,
    pub skipped_frozen: usize,
    /// Cursor targets once the batch commits, as (primary, secondary)
    pub next_cursors: (u64, u64),
}

impl BatchPlan {
    pub fn write_count(&self) -> usize {
        self.primary_writes.len() + self.secondary_writes.len()
    }

    fn count_conflicts(&self, status: ResolutionStatus) -> usize {
        self.conflicts
            .iter()
            .filter(|conflict| conflict.resolution_status == status)
            .count()
    }
}

/// Partition a snapshot into copies, no-ops and conflicts.
pub(crate) fn plan_batch(input: &PlanInput<'_>) -> BatchPlan {
    let snapshot = input.snapshot;
    let (primary_cursor, secondary_cursor) = input.cursors;
    let mut primary_writes: BTreeMap<String, Record> = BTreeMap::new();
    let mut secondary_writes: BTreeMap<String, Record> = BTreeMap::new();
    let mut plan = BatchPlan {
        next_cursors: (
            max_version(&snapshot.primary_changes).unwrap_or(primary_cursor).max(primary_cursor),
            max_version(&snapshot.secondary_changes)
                .unwrap_or(secondary_cursor)
                .max(secondary_cursor),
        ),
        ..BatchPlan::default()
    };

    let mut resolved_keys = HashSet::new();
    for conflict in input.resolutions {
        let Some(resolved) = &conflict.resolved_record else {
            continue;
        };
        if input.frozen.contains(&conflict.primary_key) {
            continue;
        }
        let highest = [
            Some(resolved.version),
            conflict.primary_version,
            conflict.secondary_version,
            snapshot
                .current(StoreId::Primary, &conflict.primary_key)
                .map(|record| record.version),
            snapshot
                .current(StoreId::Secondary, &conflict.primary_key)
                .map(|record| record.version),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);
        let record = Record {
            updated_at: input.now,
            ..resolved.with_version(highest + 1)
        };
        plan.baselines.insert(conflict.primary_key.clone(), record.checksum.clone());
        primary_writes.insert(conflict.primary_key.clone(), record.clone());
        secondary_writes.insert(conflict.primary_key.clone(), record);
        plan.applied_resolutions.push(conflict.id);
        resolved_keys.insert(conflict.primary_key.clone());
    }

    let primary_changed: HashMap<&str, &Record> = snapshot
        .primary_changes
        .iter()
        .map(|record| (record.key.primary_key.as_str(), record))
        .collect();
    let secondary_changed: HashMap<&str, &Record> = snapshot
        .secondary_changes
        .iter()
        .map(|record| (record.key.primary_key.as_str(), record))
        .collect();
    let keys: BTreeSet<&str> = primary_changed
        .keys()
        .chain(secondary_changed.keys())
        .copied()
        .collect();

    for primary_key in keys {
        if resolved_keys.contains(primary_key) {
            continue;
        }
        if input.frozen.contains(primary_key) {
            plan.skipped_frozen += 1;
            continue;
        }

        let primary = primary_changed
            .get(primary_key)
            .copied()
            .or_else(|| snapshot.primary_current.get(primary_key));
        let secondary = secondary_changed
            .get(primary_key)
            .copied()
            .or_else(|| snapshot.secondary_current.get(primary_key));
        let baseline = input.baselines.get(primary_key).map(String::as_str);

        if let (Some(primary), Some(secondary)) = (primary, secondary) {
            if primary.converged_with(secondary) {
                plan.converged += 1;
                plan.baselines.insert(primary_key.to_string(), primary.checksum.clone());
                continue;
            }
        }

        // A copy moved if it differs from the last synced content, or, for a
        // key never synced, if it is newer than its store's cursor. The
        // other copy may have moved outside this page.
        let primary_moved = moved(primary, baseline, primary_cursor);
        let secondary_moved = moved(secondary, baseline, secondary_cursor);

        match (primary, secondary) {
            (Some(primary), Some(secondary)) if primary_moved && secondary_moved => {
                match resolve(input.strategy, primary, secondary) {
                    Resolution::Winner(side) => {
                        let (winner, loser) = match side {
                            StoreId::Primary => (primary, secondary),
                            StoreId::Secondary => (secondary, primary),
                        };
                        let stamped = materialize(winner, loser.version);
                        plan.baselines.insert(primary_key.to_string(), stamped.checksum.clone());
                        primary_writes.insert(primary_key.to_string(), stamped.clone());
                        secondary_writes.insert(primary_key.to_string(), stamped.clone());
                        plan.conflicts.push(Conflict {
                            winner: Some(side),
                            resolution_status: ResolutionStatus::AutoResolved,
                            resolved_record: Some(stamped),
                            resolved_at: Some(input.now),
                            applied_at: Some(input.now),
                            ..detected(input, primary, secondary)
                        });
                    }
                    Resolution::Manual => {
                        plan.conflicts.push(detected(input, primary, secondary));
                    }
                }
            }
            (Some(primary), _) if primary_moved => {
                plan.baselines.insert(primary_key.to_string(), primary.checksum.clone());
                secondary_writes.insert(primary_key.to_string(), primary.clone());
            }
            (_, Some(secondary)) if secondary_moved => {
                plan.baselines.insert(primary_key.to_string(), secondary.checksum.clone());
                primary_writes.insert(primary_key.to_string(), secondary.clone());
            }
            // Echo of content this engine already copied.
            _ => plan.converged += 1,
        }
    }

    plan.primary_writes = primary_writes.into_values().collect();
    plan.secondary_writes = secondary_writes.into_values().collect();
    plan
}

fn moved(copy: Option<&Record>, baseline: Option<&str>, cursor: u64) -> bool {
    copy.is_some_and(|record| match baseline {
        Some(checksum) => record.checksum != checksum,
        None => record.version > cursor,
    })
}

fn detected(input: &PlanInput<'_>, primary: &Record, secondary: &Record) -> Conflict {
    Conflict {
        id: 0,
        tenant: input.tenant.clone(),
        table: input.table.to_string(),
        primary_key: primary.key.primary_key.clone(),
        primary_version: Some(primary.version),
        secondary_version: Some(secondary.version),
        detected_at: input.now,
        strategy_applied: input.strategy,
        origin: ConflictOrigin::SyncPass,
        resolution_status: ResolutionStatus::PendingManual,
        winner: None,
        primary_record: Some(primary.clone()),
        secondary_record: Some(secondary.clone()),
        resolved_record: None,
        resolved_at: None,
        applied_at: None,
    }
}

fn max_version(records: &[Record]) -> Option<u64> {
    records.iter().map(|record| record.version).max()
}

/// Write a batch to both stores, secondary first.
///
/// Each side applies its records in one transaction and is retried on its
/// own. When the primary still fails after its last attempt, the secondary's
/// rows are put back to `previous` so neither store keeps half a batch.
async fn commit_batch(
    primary: &dyn StoreAdapter,
    secondary: &dyn StoreAdapter,
    plan: &BatchPlan,
    previous: &[(RecordKey, Option<Record>)],
    policy: &RetryPolicy,
) -> RetryOutcome<()> {
    let mut attempts = 0;
    if !plan.secondary_writes.is_empty() {
        match retry_with_backoff(policy, "commit secondary", |_| {
            secondary.apply_batch(&plan.secondary_writes)
        })
        .await
        {
            RetryOutcome::Succeeded { attempts: used, .. } => attempts += used,
            RetryOutcome::Exhausted { attempts, error } => {
                return RetryOutcome::Exhausted { attempts, error };
            }
        }
    }
    if plan.primary_writes.is_empty() {
        return RetryOutcome::Succeeded { value: (), attempts };
    }

    match retry_with_backoff(policy, "commit primary", |_| {
        primary.apply_batch(&plan.primary_writes)
    })
    .await
    {
        RetryOutcome::Succeeded { attempts: used, .. } => RetryOutcome::Succeeded {
            value: (),
            attempts: attempts + used,
        },
        RetryOutcome::Exhausted { attempts: used, error } => {
            if !previous.is_empty() {
                let restored =
                    retry_with_backoff(policy, "restore secondary", |_| secondary.restore(previous))
                        .await;
                if let RetryOutcome::Exhausted { error: restore_error, .. } = restored {
                    tracing::error!(
                        rows = previous.len(),
                        error = %restore_error,
                        "Could not restore secondary after failed primary commit"
                    );
                }
            }
            RetryOutcome::Exhausted {
                attempts: attempts + used,
                error,
            }
        }
    }
}

/// Records removed by a retention purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub tombstones_primary: usize,
    pub tombstones_secondary: usize,
    pub operations: usize,
}

enum BatchOutcome {
    Committed { more: bool },
    Failed,
}

/// Coordinates sync passes between the two stores.
pub struct SyncEngine {
    primary: Arc<dyn StoreAdapter>,
    secondary: Arc<dyn StoreAdapter>,
    control: ControlDb,
    tracker: ChangeTracker,
    locks: Arc<LockManager>,
    metrics: Arc<SyncMetrics>,
    settings: SyncSettings,
    last_reports: StdMutex<HashMap<TenantId, PassReport>>,
}

impl SyncEngine {
    pub fn new(
        primary: Arc<dyn StoreAdapter>,
        secondary: Arc<dyn StoreAdapter>,
        control: ControlDb,
        settings: SyncSettings,
    ) -> Self {
        Self {
            primary,
            secondary,
            tracker: ChangeTracker::new(control.clone()),
            control,
            locks: Arc::new(LockManager::new()),
            metrics: Arc::new(SyncMetrics::default()),
            settings,
            last_reports: StdMutex::new(HashMap::new()),
        }
    }

    /// Share an existing lock manager with other components
    #[must_use]
    pub fn with_locks(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = locks;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn primary(&self) -> &Arc<dyn StoreAdapter> {
        &self.primary
    }

    pub fn secondary(&self) -> &Arc<dyn StoreAdapter> {
        &self.secondary
    }

    pub const fn control(&self) -> &ControlDb {
        &self.control
    }

    pub const fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub const fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub const fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Report of the tenant's most recent finished pass
    pub fn last_report(&self, tenant: &TenantId) -> Option<PassReport> {
        self.last_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .cloned()
    }

    /// Tenants known to either store. An unreachable store is skipped.
    pub async fn tenants(&self) -> Result<Vec<TenantId>> {
        let mut tenants = BTreeSet::new();
        let mut last_error = None;
        for store in [&self.primary, &self.secondary] {
            match store.tenants().await {
                Ok(found) => tenants.extend(found),
                Err(error) => {
                    tracing::warn!(store = %store.store_id(), error = %error, "Could not list tenants");
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) if tenants.is_empty() => Err(error),
            _ => Ok(tenants.into_iter().collect()),
        }
    }

    /// Run one pass for every known tenant
    pub async fn sync_all(&self) -> Result<Vec<PassReport>> {
        let mut reports = Vec::new();
        for tenant in self.tenants().await? {
            match self.sync_tenant(&tenant).await {
                Ok(report) => reports.push(report),
                Err(error) => {
                    tracing::error!(tenant = %tenant, error = %error, "Sync pass aborted");
                }
            }
        }
        Ok(reports)
    }

    /// Run one pass over every configured table of a tenant.
    ///
    /// A request for a tenant that is already mid-pass waits for that pass
    /// to finish and then runs its own.
    pub async fn sync_tenant(&self, tenant: &TenantId) -> Result<PassReport> {
        let _pass = self.locks.pass(tenant).await;
        let _data = self.locks.data_access().await;

        let pass_id = Uuid::now_v7();
        let started_at = now_millis();
        tracing::info!(tenant = %tenant, pass_id = %pass_id, "Sync pass started");

        let mut tables = Vec::with_capacity(self.settings.tables.len());
        for table in &self.settings.tables {
            tables.push(self.sync_table(tenant, table).await?);
        }

        let report = PassReport {
            pass_id,
            tenant: tenant.clone(),
            started_at,
            finished_at: now_millis(),
            tables,
        };
        self.metrics.record_pass();
        tracing::info!(
            tenant = %tenant,
            pass_id = %pass_id,
            written = report.total_written(),
            conflicts = report.total_conflicts(),
            failed_tables = report.failed_tables().len(),
            "Sync pass finished"
        );
        self.last_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant.clone(), report.clone());
        Ok(report)
    }

    /// Drain every pending change of one table, batch by batch.
    ///
    /// Only control database failures are returned as errors; store
    /// failures mark the table failed in the report.
    async fn sync_table(&self, tenant: &TenantId, table: &str) -> Result<TableReport> {
        let _shard = self.locks.shard(tenant, table).await;
        let mut report = TableReport::new(table);
        loop {
            match self.run_batch(tenant, table, &mut report).await? {
                BatchOutcome::Committed { more: true } => {}
                BatchOutcome::Committed { more: false } | BatchOutcome::Failed => break,
            }
        }
        tracing::debug!(
            tenant = %tenant,
            table,
            batches = report.batches,
            written_primary = report.written_primary,
            written_secondary = report.written_secondary,
            "Table synced"
        );
        Ok(report)
    }

    async fn run_batch(
        &self,
        tenant: &TenantId,
        table: &str,
        report: &mut TableReport,
    ) -> Result<BatchOutcome> {
        let cursors = self.tracker.cursors_for(tenant, table).await?;
        let frozen = self.control.frozen_keys(tenant, table).await?;
        let resolutions = self.control.awaiting_apply(tenant, table).await?;
        let resolution_keys: Vec<String> = resolutions
            .iter()
            .map(|conflict| conflict.primary_key.clone())
            .collect();

        let fetched = retry_with_backoff(&self.settings.retry, "fetch changes", |_| {
            self.fetch_snapshot(tenant, table, cursors, &resolution_keys)
        })
        .await;
        let snapshot = match fetched {
            RetryOutcome::Succeeded { value, .. } => value,
            RetryOutcome::Exhausted { attempts, error } => {
                self.fail_batch(tenant, table, cursors, 0, attempts, &error, report)
                    .await?;
                return Ok(BatchOutcome::Failed);
            }
        };

        let touched: Vec<String> = snapshot
            .primary_changes
            .iter()
            .chain(&snapshot.secondary_changes)
            .map(|record| record.key.primary_key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let baselines = self.control.baselines(tenant, table, &touched).await?;

        let strategy = self.settings.strategy_for(tenant);
        let plan = plan_batch(&PlanInput {
            tenant,
            table,
            strategy,
            cursors,
            snapshot: &snapshot,
            frozen: &frozen,
            baselines: &baselines,
            resolutions: &resolutions,
            now: now_millis(),
        });

        let previous: Vec<(RecordKey, Option<Record>)> = plan
            .secondary_writes
            .iter()
            .map(|record| {
                let current = snapshot.current(StoreId::Secondary, &record.key.primary_key);
                (record.key.clone(), current.cloned())
            })
            .collect();
        let committed = commit_batch(
            self.primary.as_ref(),
            self.secondary.as_ref(),
            &plan,
            &previous,
            &self.settings.retry,
        )
        .await;
        if let RetryOutcome::Exhausted { attempts, error } = committed {
            self.fail_batch(tenant, table, cursors, plan.write_count(), attempts, &error, report)
                .await?;
            return Ok(BatchOutcome::Failed);
        }

        let batch = CommittedBatch {
            primary_version: plan.next_cursors.0,
            secondary_version: plan.next_cursors.1,
            conflicts: plan.conflicts.clone(),
            applied_resolutions: plan.applied_resolutions.clone(),
            baselines: plan
                .baselines
                .iter()
                .map(|(key, checksum)| (key.clone(), checksum.clone()))
                .collect(),
        };
        let ids = self.tracker.commit(tenant, table, &batch, now_millis()).await?;

        let auto = plan.count_conflicts(ResolutionStatus::AutoResolved);
        let manual = plan.count_conflicts(ResolutionStatus::PendingManual);
        for (conflict, id) in plan.conflicts.iter().zip(&ids) {
            if conflict.is_pending() {
                tracing::warn!(
                    tenant = %tenant,
                    table,
                    primary_key = %conflict.primary_key,
                    conflict_id = id,
                    "Conflict awaiting manual resolution"
                );
            } else {
                tracing::warn!(
                    tenant = %tenant,
                    table,
                    primary_key = %conflict.primary_key,
                    strategy = %conflict.strategy_applied,
                    winner = ?conflict.winner,
                    "Conflict auto-resolved"
                );
            }
        }

        self.metrics
            .record_batch_committed(plan.write_count() as u64, auto as u64, manual as u64);
        report.batches += 1;
        report.pulled_primary += snapshot.primary_changes.len();
        report.pulled_secondary += snapshot.secondary_changes.len();
        report.written_primary += plan.primary_writes.len();
        report.written_secondary += plan.secondary_writes.len();
        report.converged += plan.converged;
        report.conflicts_auto += auto;
        report.conflicts_manual += manual;
        report.resolutions_applied += plan.applied_resolutions.len();
        report.skipped_frozen += plan.skipped_frozen;

        let limit = self.settings.batch_size;
        let full_page = snapshot.primary_changes.len() >= limit
            || snapshot.secondary_changes.len() >= limit;
        Ok(BatchOutcome::Committed {
            more: full_page && plan.next_cursors != cursors,
        })
    }

    async fn fetch_snapshot(
        &self,
        tenant: &TenantId,
        table: &str,
        cursors: (u64, u64),
        resolution_keys: &[String],
    ) -> Result<Snapshot> {
        let limit = self.settings.batch_size;
        let primary_changes = self
            .primary
            .fetch_changed_since(tenant, table, cursors.0, limit)
            .await?;
        let secondary_changes = self
            .secondary
            .fetch_changed_since(tenant, table, cursors.1, limit)
            .await?;

        let primary_lookup = missing_keys(&primary_changes, &secondary_changes, resolution_keys);
        let secondary_lookup = missing_keys(&secondary_changes, &primary_changes, resolution_keys);
        let primary_current = self.lookup(self.primary.as_ref(), tenant, table, &primary_lookup).await?;
        let secondary_current = self
            .lookup(self.secondary.as_ref(), tenant, table, &secondary_lookup)
            .await?;

        Ok(Snapshot {
            primary_changes,
            secondary_changes,
            primary_current,
            secondary_current,
        })
    }

    async fn lookup(
        &self,
        store: &dyn StoreAdapter,
        tenant: &TenantId,
        table: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Record>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        Ok(store
            .get_many(tenant, table, keys)
            .await?
            .into_iter()
            .map(|record| (record.key.primary_key.clone(), record))
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail_batch(
        &self,
        tenant: &TenantId,
        table: &str,
        cursors: (u64, u64),
        record_count: usize,
        attempts: u32,
        error: &Error,
        report: &mut TableReport,
    ) -> Result<()> {
        tracing::error!(
            tenant = %tenant,
            table,
            attempts,
            record_count,
            error = %error,
            "Sync batch failed, cursors left in place"
        );
        self.metrics.record_batch_failed();
        self.control
            .record_failed_batch(&FailedBatch {
                id: 0,
                tenant: tenant.clone(),
                table: table.to_string(),
                primary_cursor: cursors.0,
                secondary_cursor: cursors.1,
                record_count,
                attempts,
                error: error.to_string(),
                failed_at: now_millis(),
            })
            .await?;
        report.failed = Some(error.to_string());
        Ok(())
    }

    /// Record an operator's decision for a pending manual conflict.
    ///
    /// The chosen content is written to both stores by the next pass over
    /// the conflict's table.
    pub async fn resolve_conflict(
        &self,
        tenant: &TenantId,
        id: i64,
        choice: Choice,
    ) -> Result<Conflict> {
        let conflict = self
            .control
            .conflict(tenant, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))?;
        if !conflict.is_pending() {
            return Err(Error::InvalidInput(format!(
                "conflict {id} is {}, not pending_manual",
                conflict.resolution_status.as_str()
            )));
        }

        let (winner, resolved) = match choice {
            Choice::KeepPrimary => (
                Some(StoreId::Primary),
                conflict.primary_record.clone().ok_or_else(|| {
                    Error::InvalidInput(format!("conflict {id} has no primary copy to keep"))
                })?,
            ),
            Choice::KeepSecondary => (
                Some(StoreId::Secondary),
                conflict.secondary_record.clone().ok_or_else(|| {
                    Error::InvalidInput(format!("conflict {id} has no secondary copy to keep"))
                })?,
            ),
            Choice::Replace(fields) => {
                let key = RecordKey::new(
                    conflict.tenant.clone(),
                    conflict.table.clone(),
                    conflict.primary_key.clone(),
                )?;
                let version = conflict
                    .primary_version
                    .max(conflict.secondary_version)
                    .unwrap_or(0);
                (None, Record::new(key, fields, version, now_millis()))
            }
        };

        let resolved_at = now_millis();
        if !self
            .control
            .resolve_conflict(&conflict, winner, &resolved, resolved_at)
            .await?
        {
            return Err(Error::InvalidInput(format!(
                "conflict {id} was resolved concurrently"
            )));
        }
        tracing::info!(
            tenant = %tenant,
            table = %conflict.table,
            primary_key = %conflict.primary_key,
            conflict_id = id,
            winner = ?winner,
            "Conflict resolved manually"
        );

        self.control
            .conflict(tenant, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {id}")))
    }

    /// Purge tombstones and applied queue entries older than `retention`
    pub async fn purge_expired(&self, retention: Duration) -> Result<PurgeReport> {
        let _data = self.locks.data_access().await;
        let before = millis_before(now_millis(), retention);
        let report = PurgeReport {
            tombstones_primary: self.primary.purge_tombstones(before).await?,
            tombstones_secondary: self.secondary.purge_tombstones(before).await?,
            operations: self.control.purge_applied_operations(before).await?,
        };
        tracing::info!(
            tombstones_primary = report.tombstones_primary,
            tombstones_secondary = report.tombstones_secondary,
            operations = report.operations,
            "Expired data purged"
        );
        Ok(report)
    }
}

/// Keys present in `other` or requested explicitly but absent from `own`
fn missing_keys(own: &[Record], other: &[Record], requested: &[String]) -> Vec<String> {
    let present: HashSet<&str> = own.iter().map(|record| record.key.primary_key.as_str()).collect();
    let mut keys: Vec<String> = other
        .iter()
        .map(|record| record.key.primary_key.as_str())
        .chain(requested.iter().map(String::as_str))
        .filter(|key| !present.contains(key))
        .map(str::to_string)
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    use super::*;
    use crate::store::MemoryStore;
    use crate::sync::RetryPolicy;

    fn tenant() -> TenantId {
        TenantId::new("clinic").unwrap()
    }

    fn record(pk: &str, name: &str, version: u64, updated_at: i64) -> Record {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        let key = RecordKey::new(tenant(), "patients", pk).unwrap();
        Record::new(key, fields, version, updated_at)
    }

    fn plan(
        strategy: ConflictStrategy,
        cursors: (u64, u64),
        snapshot: &Snapshot,
        frozen: &HashSet<String>,
        resolutions: &[Conflict],
    ) -> BatchPlan {
        plan_with_baselines(strategy, cursors, snapshot, frozen, resolutions, &HashMap::new())
    }

    fn plan_with_baselines(
        strategy: ConflictStrategy,
        cursors: (u64, u64),
        snapshot: &Snapshot,
        frozen: &HashSet<String>,
        resolutions: &[Conflict],
        baselines: &HashMap<String, String>,
    ) -> BatchPlan {
        plan_batch(&PlanInput {
            tenant: &tenant(),
            table: "patients",
            strategy,
            cursors,
            snapshot,
            frozen,
            baselines,
            resolutions,
            now: 1_000,
        })
    }

    fn keys(records: &[Record]) -> Vec<&str> {
        records.iter().map(|record| record.key.primary_key.as_str()).collect()
    }

    #[test]
    fn one_sided_changes_are_copied_across() {
        let snapshot = Snapshot {
            primary_changes: vec![record("a", "Ana", 3, 10)],
            secondary_changes: vec![record("b", "Bo", 2, 10)],
            ..Snapshot::default()
        };
        let plan = plan(ConflictStrategy::PrimaryWins, (0, 0), &snapshot, &HashSet::new(), &[]);

        assert_eq!(keys(&plan.secondary_writes), vec!["a"]);
        assert_eq!(keys(&plan.primary_writes), vec!["b"]);
        assert_eq!(plan.secondary_writes[0].version, 3);
        assert!(plan.conflicts.is_empty());
        assert_eq!(plan.next_cursors, (3, 2));
    }

    #[test]
    fn identical_content_on_both_sides_is_a_no_op() {
        let snapshot = Snapshot {
            primary_changes: vec![record("a", "Ana", 5, 10)],
            secondary_changes: vec![record("a", "Ana", 7, 99)],
            ..Snapshot::default()
        };
        let plan = plan(ConflictStrategy::Manual, (0, 0), &snapshot, &HashSet::new(), &[]);

        assert_eq!(plan.write_count(), 0);
        assert_eq!(plan.converged, 1);
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn divergent_pair_is_resolved_and_restamped() {
        let snapshot = Snapshot {
            primary_changes: vec![record("p", "Ana", 5, 10)],
            secondary_changes: vec![record("p", "Anna", 5, 20)],
            ..Snapshot::default()
        };
        let plan = plan(ConflictStrategy::PrimaryWins, (4, 4), &snapshot, &HashSet::new(), &[]);

        assert_eq!(plan.primary_writes, plan.secondary_writes);
        assert_eq!(plan.primary_writes[0].version, 6);
        assert_eq!(plan.primary_writes[0].fields["name"], json!("Ana"));
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.conflicts[0].resolution_status, ResolutionStatus::AutoResolved);
        assert_eq!(plan.conflicts[0].winner, Some(StoreId::Primary));
    }

    #[test]
    fn newest_wins_uses_updated_at() {
        let snapshot = Snapshot {
            primary_changes: vec![record("p", "Ana", 9, 10)],
            secondary_changes: vec![record("p", "Anna", 2, 20)],
            ..Snapshot::default()
        };
        let plan = plan(ConflictStrategy::NewestWins, (0, 0), &snapshot, &HashSet::new(), &[]);

        assert_eq!(plan.primary_writes[0].fields["name"], json!("Anna"));
        assert_eq!(plan.primary_writes[0].version, 10);
        assert_eq!(plan.conflicts[0].winner, Some(StoreId::Secondary));
    }

    #[test]
    fn manual_strategy_writes_nothing_and_opens_conflict() {
        let snapshot = Snapshot {
            primary_changes: vec![record("p", "Ana", 5, 10), record("q", "Quinn", 6, 10)],
            secondary_changes: vec![record("p", "Anna", 5, 20)],
            ..Snapshot::default()
        };
        let plan = plan(ConflictStrategy::Manual, (0, 0), &snapshot, &HashSet::new(), &[]);

        assert_eq!(keys(&plan.secondary_writes), vec!["q"]);
        assert!(plan.primary_writes.is_empty());
        assert_eq!(plan.conflicts.len(), 1);
        assert!(plan.conflicts[0].is_pending());
        assert_eq!(plan.next_cursors, (6, 5));
    }

    #[test]
    fn one_sided_change_collides_with_copy_outside_the_page() {
        let mut secondary_current = HashMap::new();
        secondary_current.insert("p".to_string(), record("p", "Anna", 12, 20));
        let snapshot = Snapshot {
            primary_changes: vec![record("p", "Ana", 5, 10)],
            secondary_current,
            ..Snapshot::default()
        };
        let plan = plan(ConflictStrategy::PrimaryWins, (0, 10), &snapshot, &HashSet::new(), &[]);

        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.secondary_writes[0].version, 13);
    }

    #[test]
    fn stale_copy_on_the_other_side_is_overwritten() {
        let mut secondary_current = HashMap::new();
        secondary_current.insert("p".to_string(), record("p", "Old", 3, 1));
        let snapshot = Snapshot {
            primary_changes: vec![record("p", "Ana", 5, 10)],
            secondary_current,
            ..Snapshot::default()
        };
        let plan = plan(ConflictStrategy::Manual, (0, 10), &snapshot, &HashSet::new(), &[]);

        assert!(plan.conflicts.is_empty());
        assert_eq!(keys(&plan.secondary_writes), vec!["p"]);
    }

    #[test]
    fn frozen_keys_are_skipped() {
        let snapshot = Snapshot {
            primary_changes: vec![record("p", "Ana", 5, 10), record("q", "Quinn", 6, 10)],
            ..Snapshot::default()
        };
        let frozen: HashSet<String> = ["p".to_string()].into_iter().collect();
        let plan = plan(ConflictStrategy::PrimaryWins, (0, 0), &snapshot, &frozen, &[]);

        assert_eq!(keys(&plan.secondary_writes), vec!["q"]);
        assert_eq!(plan.skipped_frozen, 1);
        assert_eq!(plan.next_cursors, (6, 0));
    }

    #[test]
    fn manual_resolution_supersedes_both_copies() {
        let primary = record("p", "Ana", 5, 10);
        let secondary = record("p", "Anna", 7, 20);
        let resolution = Conflict {
            id: 42,
            resolution_status: ResolutionStatus::ResolvedManual,
            winner: Some(StoreId::Secondary),
            resolved_record: Some(secondary.clone()),
            resolved_at: Some(500),
            ..detected(
                &PlanInput {
                    tenant: &tenant(),
                    table: "patients",
                    strategy: ConflictStrategy::Manual,
                    cursors: (0, 0),
                    snapshot: &Snapshot::default(),
                    frozen: &HashSet::new(),
                    baselines: &HashMap::new(),
                    resolutions: &[],
                    now: 1,
                },
                &primary,
                &secondary,
            )
        };
        let snapshot = Snapshot {
            primary_changes: vec![record("p", "Ana again", 9, 30)],
            ..Snapshot::default()
        };
        let plan = plan(
            ConflictStrategy::PrimaryWins,
            (5, 7),
            &snapshot,
            &HashSet::new(),
            std::slice::from_ref(&resolution),
        );

        assert_eq!(plan.applied_resolutions, vec![42]);
        assert_eq!(plan.primary_writes, plan.secondary_writes);
        assert_eq!(plan.primary_writes[0].version, 10);
        assert_eq!(plan.primary_writes[0].fields["name"], json!("Anna"));
        assert!(plan.conflicts.is_empty());
    }

    #[test]
    fn copied_content_coming_back_is_an_echo() {
        let synced = record("p", "Ana", 5, 10);
        let baselines: HashMap<String, String> =
            [("p".to_string(), synced.checksum.clone())].into_iter().collect();
        let mut primary_current = HashMap::new();
        primary_current.insert("p".to_string(), synced.clone());
        let snapshot = Snapshot {
            secondary_changes: vec![synced.with_version(12)],
            primary_current,
            ..Snapshot::default()
        };
        let echo = plan_with_baselines(
            ConflictStrategy::Manual,
            (5, 11),
            &snapshot,
            &HashSet::new(),
            &[],
            &baselines,
        );
        assert_eq!(echo.write_count(), 0);
        assert!(echo.conflicts.is_empty());

        // A later edit on the primary is a plain copy, not a collision.
        let mut secondary_current = HashMap::new();
        secondary_current.insert("p".to_string(), synced.with_version(12));
        let snapshot = Snapshot {
            primary_changes: vec![record("p", "Ana Maria", 6, 30)],
            secondary_current,
            ..Snapshot::default()
        };
        let edit = plan_with_baselines(
            ConflictStrategy::Manual,
            (5, 12),
            &snapshot,
            &HashSet::new(),
            &[],
            &baselines,
        );
        assert!(edit.conflicts.is_empty());
        assert_eq!(keys(&edit.secondary_writes), vec!["p"]);
        assert_eq!(edit.baselines["p"], edit.secondary_writes[0].checksum);
    }

    #[test]
    fn edits_on_both_sides_after_a_sync_collide() {
        let synced = record("p", "Ana", 5, 10);
        let baselines: HashMap<String, String> =
            [("p".to_string(), synced.checksum.clone())].into_iter().collect();
        let snapshot = Snapshot {
            primary_changes: vec![record("p", "Ana B", 6, 30)],
            secondary_changes: vec![record("p", "Ana C", 13, 40)],
            ..Snapshot::default()
        };
        let plan = plan_with_baselines(
            ConflictStrategy::Manual,
            (5, 12),
            &snapshot,
            &HashSet::new(),
            &[],
            &baselines,
        );
        assert_eq!(plan.conflicts.len(), 1);
        assert!(plan.baselines.is_empty());
    }

    fn engine(primary: &Arc<MemoryStore>, secondary: &Arc<MemoryStore>) -> SyncEngine {
        let settings = SyncSettings {
            tables: vec!["patients".to_string(), "appointments".to_string()],
            retry: RetryPolicy::immediate(2),
            batch_size: 2,
            ..SyncSettings::default()
        };
        SyncEngine::new(
            Arc::clone(primary) as Arc<dyn StoreAdapter>,
            Arc::clone(secondary) as Arc<dyn StoreAdapter>,
            ControlDb::open_in_memory().unwrap(),
            settings,
        )
    }

    fn fields(name: &str) -> Map<String, serde_json::Value> {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        fields
    }

    fn key(table: &str, pk: &str) -> RecordKey {
        RecordKey::new(tenant(), table, pk).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pass_copies_across_multiple_batches() {
        let primary = Arc::new(MemoryStore::primary());
        let secondary = Arc::new(MemoryStore::secondary());
        for pk in ["a", "b", "c", "d", "e"] {
            primary.write(&key("patients", pk), fields(pk)).await.unwrap();
        }
        let engine = engine(&primary, &secondary);

        let report = engine.sync_tenant(&tenant()).await.unwrap();
        let patients = report.table("patients").unwrap();
        assert_eq!(patients.written_secondary, 5);
        assert!(patients.batches >= 3);
        assert_eq!(secondary.records(&tenant(), "patients").await.len(), 5);
        assert_eq!(
            engine.tracker().cursors_for(&tenant(), "patients").await.unwrap().0,
            5
        );
        assert_eq!(engine.last_report(&tenant()), Some(report));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exhausted_batch_is_logged_and_next_table_continues() {
        let primary = Arc::new(MemoryStore::primary());
        let secondary = Arc::new(MemoryStore::secondary());
        primary.write(&key("patients", "p"), fields("Ana")).await.unwrap();
        primary.write(&key("appointments", "x"), fields("Checkup")).await.unwrap();
        secondary.fail_next_batches(2);
        let engine = engine(&primary, &secondary);

        let report = engine.sync_tenant(&tenant()).await.unwrap();
        assert!(report.table("patients").unwrap().is_failed());
        assert_eq!(report.table("appointments").unwrap().written_secondary, 1);
        assert_eq!(engine.tracker().cursors_for(&tenant(), "patients").await.unwrap(), (0, 0));
        assert_eq!(engine.control().failed_batches(&tenant(), 10).await.unwrap().len(), 1);
        assert_eq!(engine.metrics().snapshot().batches_failed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolving_a_non_pending_conflict_is_rejected() {
        let primary = Arc::new(MemoryStore::primary());
        let secondary = Arc::new(MemoryStore::secondary());
        let engine = engine(&primary, &secondary);

        let missing = engine.resolve_conflict(&tenant(), 7, Choice::KeepPrimary).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }
}
