//! In-process store with fault injection

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{page_without_split, StoreAdapter, WriteOutcome};
use crate::error::{Error, Result};
use crate::models::{Record, RecordKey, StoreId, TenantId};
use crate::util::now_millis;

type Shard = (TenantId, String);

#[derive(Default)]
struct Inner {
    records: BTreeMap<Shard, BTreeMap<String, Record>>,
    clocks: HashMap<Shard, u64>,
    scripts: Vec<String>,
}

impl Inner {
    fn next_version(&mut self, shard: &Shard) -> u64 {
        let clock = self.clocks.entry(shard.clone()).or_insert(0);
        *clock += 1;
        *clock
    }

    fn observe_version(&mut self, shard: &Shard, version: u64) {
        let clock = self.clocks.entry(shard.clone()).or_insert(0);
        *clock = (*clock).max(version);
    }

    fn upsert(&mut self, record: &Record) -> WriteOutcome {
        let shard = (record.key.tenant.clone(), record.key.table.clone());
        self.observe_version(&shard, record.version);
        let rows = self.records.entry(shard).or_default();
        if rows
            .get(&record.key.primary_key)
            .is_some_and(|existing| record.is_same_revision(existing))
        {
            return WriteOutcome::Unchanged;
        }
        rows.insert(record.key.primary_key.clone(), record.clone());
        WriteOutcome::Applied
    }
}

/// Store kept entirely in memory.
///
/// Reachability can be toggled and batch commits can be made to fail, which
/// lets tests drive outages and retries deterministically.
pub struct MemoryStore {
    id: StoreId,
    inner: Mutex<Inner>,
    reachable: AtomicBool,
    failing_batches: AtomicU32,
}

impl MemoryStore {
    pub fn new(id: StoreId) -> Self {
        Self {
            id,
            inner: Mutex::new(Inner::default()),
            reachable: AtomicBool::new(true),
            failing_batches: AtomicU32::new(0),
        }
    }

    pub fn primary() -> Self {
        Self::new(StoreId::Primary)
    }

    pub fn secondary() -> Self {
        Self::new(StoreId::Secondary)
    }

    /// Make every call fail with `Unavailable` while `false`
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Fail the next `count` batch commits with a transient error
    pub fn fail_next_batches(&self, count: u32) {
        self.failing_batches.store(count, Ordering::SeqCst);
    }

    /// Every record of a shard, ordered by primary key
    pub async fn records(&self, tenant: &TenantId, table: &str) -> Vec<Record> {
        let inner = self.inner.lock().await;
        inner
            .records
            .get(&(tenant.clone(), table.to_string()))
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Schema scripts executed so far, in order
    pub async fn applied_scripts(&self) -> Vec<String> {
        self.inner.lock().await.scripts.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(Error::unavailable(self.id, "store unreachable"))
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn store_id(&self) -> StoreId {
        self.id
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn tenants(&self) -> Result<Vec<TenantId>> {
        self.check_reachable()?;
        let inner = self.inner.lock().await;
        let tenants: BTreeSet<TenantId> = inner
            .records
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|((tenant, _), _)| tenant.clone())
            .collect();
        Ok(tenants.into_iter().collect())
    }

    async fn fetch_changed_since(
        &self,
        tenant: &TenantId,
        table: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<Record>> {
        self.check_reachable()?;
        let inner = self.inner.lock().await;
        let mut changed: Vec<Record> = inner
            .records
            .get(&(tenant.clone(), table.to_string()))
            .map(|rows| {
                rows.values()
                    .filter(|record| record.version > cursor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        changed.sort_by(|a, b| {
            a.version
                .cmp(&b.version)
                .then_with(|| a.key.primary_key.cmp(&b.key.primary_key))
        });
        Ok(page_without_split(changed, limit))
    }

    async fn get_many(
        &self,
        tenant: &TenantId,
        table: &str,
        primary_keys: &[String],
    ) -> Result<Vec<Record>> {
        self.check_reachable()?;
        let inner = self.inner.lock().await;
        let Some(rows) = inner.records.get(&(tenant.clone(), table.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(primary_keys
            .iter()
            .filter_map(|pk| rows.get(pk).cloned())
            .collect())
    }

    async fn write(&self, key: &RecordKey, fields: Map<String, Value>) -> Result<Record> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().await;
        let shard = (key.tenant.clone(), key.table.clone());
        let version = inner.next_version(&shard);
        let record = Record::new(key.clone(), fields, version, now_millis());
        inner.upsert(&record);
        Ok(record)
    }

    async fn upsert(&self, record: &Record) -> Result<WriteOutcome> {
        self.check_reachable()?;
        Ok(self.inner.lock().await.upsert(record))
    }

    async fn tombstone(&self, key: &RecordKey) -> Result<Option<Record>> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().await;
        let shard = (key.tenant.clone(), key.table.clone());
        let Some(existing) = inner
            .records
            .get(&shard)
            .and_then(|rows| rows.get(&key.primary_key))
            .cloned()
        else {
            return Ok(None);
        };
        if existing.is_tombstoned() {
            return Ok(Some(existing));
        }
        let version = inner.next_version(&shard);
        let deleted = existing.tombstoned(version, now_millis());
        inner.upsert(&deleted);
        Ok(Some(deleted))
    }

    async fn apply_batch(&self, records: &[Record]) -> Result<Vec<WriteOutcome>> {
        self.check_reachable()?;
        if self.take_injected_failure() {
            return Err(Error::unavailable(self.id, "injected batch failure"));
        }
        let mut inner = self.inner.lock().await;
        Ok(records.iter().map(|record| inner.upsert(record)).collect())
    }

    async fn restore(&self, rows: &[(RecordKey, Option<Record>)]) -> Result<()> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().await;
        for (key, previous) in rows {
            let shard = (key.tenant.clone(), key.table.clone());
            let rows = inner.records.entry(shard).or_default();
            match previous {
                Some(record) => {
                    rows.insert(key.primary_key.clone(), record.clone());
                }
                None => {
                    rows.remove(&key.primary_key);
                }
            }
        }
        Ok(())
    }

    async fn apply_migration_step(&self, script: &str) -> Result<()> {
        self.check_reachable()?;
        self.inner.lock().await.scripts.push(script.to_string());
        Ok(())
    }

    async fn purge_tombstones(&self, before: i64) -> Result<usize> {
        self.check_reachable()?;
        let mut inner = self.inner.lock().await;
        let mut purged = 0;
        for rows in inner.records.values_mut() {
            let len = rows.len();
            rows.retain(|_, record| record.tombstoned_at.is_none_or(|at| at >= before));
            purged += len - rows.len();
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn key(pk: &str) -> RecordKey {
        RecordKey::new(TenantId::new("clinic").unwrap(), "patients", pk).unwrap()
    }

    fn fields(name: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("name".into(), json!(name));
        map
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_writes_tick_the_clock() {
        let store = MemoryStore::primary();
        let first = store.write(&key("a"), fields("Ana")).await.unwrap();
        let second = store.write(&key("b"), fields("Bo")).await.unwrap();
        let third = store.write(&key("a"), fields("Ana 2")).await.unwrap();
        assert_eq!((first.version, second.version, third.version), (1, 2, 3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upsert_of_same_revision_is_unchanged() {
        let store = MemoryStore::secondary();
        let record = Record::new(key("a"), fields("Ana"), 7, 100);
        assert_eq!(store.upsert(&record).await.unwrap(), WriteOutcome::Applied);
        assert_eq!(store.upsert(&record).await.unwrap(), WriteOutcome::Unchanged);

        let local = store.write(&key("b"), fields("Bo")).await.unwrap();
        assert_eq!(local.version, 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetch_is_ordered_and_scoped() {
        let store = MemoryStore::primary();
        store.write(&key("a"), fields("Ana")).await.unwrap();
        store.write(&key("b"), fields("Bo")).await.unwrap();
        let other = RecordKey::new(TenantId::new("other").unwrap(), "patients", "z").unwrap();
        store.write(&other, fields("Zed")).await.unwrap();

        let tenant = TenantId::new("clinic").unwrap();
        let changed = store.fetch_changed_since(&tenant, "patients", 1, 10).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].key.primary_key, "b");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstone_keeps_row_until_purged() {
        let store = MemoryStore::primary();
        store.write(&key("a"), fields("Ana")).await.unwrap();
        let deleted = store.tombstone(&key("a")).await.unwrap().unwrap();
        assert!(deleted.is_tombstoned());
        assert_eq!(deleted.version, 2);

        let again = store.tombstone(&key("a")).await.unwrap().unwrap();
        assert_eq!(again, deleted);
        assert!(store.tombstone(&key("missing")).await.unwrap().is_none());

        let at = deleted.tombstoned_at.unwrap();
        assert_eq!(store.purge_tombstones(at).await.unwrap(), 0);
        assert_eq!(store.purge_tombstones(at + 1).await.unwrap(), 1);
        assert!(store.get(&key("a")).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn injected_failures_and_outages_are_transient() {
        let store = MemoryStore::primary();
        let record = Record::new(key("a"), fields("Ana"), 1, 1);
        store.fail_next_batches(1);
        let err = store.apply_batch(std::slice::from_ref(&record)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            store.apply_batch(std::slice::from_ref(&record)).await.unwrap(),
            vec![WriteOutcome::Applied]
        );

        store.set_reachable(false);
        assert!(store.ping().await.unwrap_err().is_transient());
        store.set_reachable(true);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restore_ignores_injected_batch_failures() {
        let store = MemoryStore::secondary();
        let before = store.write(&key("a"), fields("Ana")).await.unwrap();
        store
            .apply_batch(&[Record::new(key("a"), fields("Ana 2"), 5, 2)])
            .await
            .unwrap();

        store.fail_next_batches(1);
        store.restore(&[(key("a"), Some(before.clone()))]).await.unwrap();
        assert_eq!(store.get(&key("a")).await.unwrap(), Some(before));

        // The injected failure is still armed for the next real batch.
        assert!(store.apply_batch(&[]).await.is_err());
    }
}
