//! Uniform adapter over the two physical stores

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{Record, RecordKey, StoreId, TenantId};

/// Effect of writing a record onto a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// The store already held this exact revision
    Unchanged,
}

/// Storage operations the sync machinery needs from either store.
///
/// Every call is scoped to one tenant and table. Writing a revision the
/// store already holds is a no-op, never an error.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Which side of the pair this adapter serves
    fn store_id(&self) -> StoreId;

    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;

    /// Tenants that own at least one record
    async fn tenants(&self) -> Result<Vec<TenantId>>;

    /// Records with `version > cursor`, ascending by version.
    ///
    /// At most `limit` records are returned, except that a page never ends
    /// between two records sharing a version, so resuming from the last
    /// version seen never skips anything.
    async fn fetch_changed_since(
        &self,
        tenant: &TenantId,
        table: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Current copies (live or tombstoned) of the given keys; missing keys are omitted
    async fn get_many(
        &self,
        tenant: &TenantId,
        table: &str,
        primary_keys: &[String],
    ) -> Result<Vec<Record>>;

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        let mut found = self
            .get_many(&key.tenant, &key.table, std::slice::from_ref(&key.primary_key))
            .await?;
        Ok(found.pop())
    }

    /// Local edit: store `fields` under the next version of this store's clock
    async fn write(&self, key: &RecordKey, fields: Map<String, Value>) -> Result<Record>;

    /// Replicated write: store `record` keeping its version
    async fn upsert(&self, record: &Record) -> Result<WriteOutcome>;

    /// Local soft delete under the next clock version.
    ///
    /// Returns `None` when the key does not exist; tombstoning an already
    /// tombstoned record returns it unchanged.
    async fn tombstone(&self, key: &RecordKey) -> Result<Option<Record>>;

    /// Upsert every record in one transaction: all of them land or none do
    async fn apply_batch(&self, records: &[Record]) -> Result<Vec<WriteOutcome>>;

    /// Put rows back exactly as they were, in one transaction.
    ///
    /// `Some` rewrites the row with that record, `None` removes the key.
    /// Clocks are left alone so later local writes still move forward.
    async fn restore(&self, rows: &[(RecordKey, Option<Record>)]) -> Result<()>;

    /// Execute a schema script
    async fn apply_migration_step(&self, script: &str) -> Result<()>;

    /// Physically remove tombstones older than `before` (unix ms)
    async fn purge_tombstones(&self, before: i64) -> Result<usize>;
}

/// Pick the records of `ordered` (ascending by version) that form one page.
///
/// Keeps at least `limit` records and then extends through every record that
/// shares the last included version.
pub(crate) fn page_without_split(mut ordered: Vec<Record>, limit: usize) -> Vec<Record> {
    let limit = limit.max(1);
    if ordered.len() <= limit {
        return ordered;
    }
    let boundary = ordered[limit - 1].version;
    let end = ordered
        .iter()
        .skip(limit)
        .position(|record| record.version != boundary)
        .map_or(ordered.len(), |offset| limit + offset);
    ordered.truncate(end);
    ordered
}
