//! `SQLite`-backed store adapter

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite stores versions as i64

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use super::{StoreAdapter, WriteOutcome};
use crate::error::{Error, Result};
use crate::models::{Record, RecordKey, StoreId, TenantId};
use crate::util::now_millis;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        fields TEXT NOT NULL,
        version INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        tombstoned_at INTEGER,
        PRIMARY KEY (tenant_id, table_name, primary_key)
    );
    CREATE INDEX IF NOT EXISTS idx_records_version
        ON records(tenant_id, table_name, version);
    CREATE INDEX IF NOT EXISTS idx_records_tombstoned
        ON records(tombstoned_at) WHERE tombstoned_at IS NOT NULL;
    CREATE TABLE IF NOT EXISTS clocks (
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        clock INTEGER NOT NULL,
        PRIMARY KEY (tenant_id, table_name)
    );
";

const RECORD_COLUMNS: &str =
    "tenant_id, table_name, primary_key, fields, version, checksum, updated_at, tombstoned_at";

/// Store adapter over a single `SQLite` database file.
///
/// The connection lives behind a blocking mutex and every statement runs on
/// tokio's blocking pool, so a slow disk or a held write lock never stalls
/// the async workers.
pub struct SqliteStore {
    id: StoreId,
    conn: Arc<StdMutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) a store database at `path`
    pub fn open(id: StoreId, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(id, Connection::open(path)?)
    }

    /// Open an in-memory store (useful for testing)
    pub fn open_in_memory(id: StoreId) -> Result<Self> {
        Self::with_connection(id, Connection::open_in_memory()?)
    }

    fn with_connection(id: StoreId, conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(store = %id, "Opened SQLite store");
        Ok(Self {
            id,
            conn: Arc::new(StdMutex::new(conn)),
        })
    }

    /// Run `work` against the connection on the blocking thread pool
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            work(&mut conn)
        })
        .await?
    }

    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
        let tenant: String = row.get(0)?;
        let fields = match row.get::<_, Value>(3)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Record {
            key: RecordKey {
                tenant: TenantId::new(tenant)
                    .map_err(|error| rusqlite::Error::InvalidParameterName(error.to_string()))?,
                table: row.get(1)?,
                primary_key: row.get(2)?,
            },
            fields,
            version: row.get::<_, i64>(4)? as u64,
            checksum: row.get(5)?,
            updated_at: row.get(6)?,
            tombstoned_at: row.get(7)?,
        })
    }

    fn find(conn: &Connection, key: &RecordKey) -> Result<Option<Record>> {
        let record = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE tenant_id = ? AND table_name = ? AND primary_key = ?"
                ),
                params![key.tenant.as_str(), key.table, key.primary_key],
                Self::parse_record,
            )
            .optional()?;
        Ok(record)
    }

    fn next_version(conn: &Connection, tenant: &TenantId, table: &str) -> Result<u64> {
        let clock: i64 = conn.query_row(
            "INSERT INTO clocks (tenant_id, table_name, clock) VALUES (?, ?, 1)
             ON CONFLICT(tenant_id, table_name) DO UPDATE SET clock = clock + 1
             RETURNING clock",
            params![tenant.as_str(), table],
            |row| row.get(0),
        )?;
        Ok(clock as u64)
    }

    fn upsert_row(conn: &Connection, record: &Record) -> Result<WriteOutcome> {
        conn.execute(
            "INSERT INTO clocks (tenant_id, table_name, clock) VALUES (?, ?, ?)
             ON CONFLICT(tenant_id, table_name) DO UPDATE SET clock = MAX(clock, excluded.clock)",
            params![
                record.key.tenant.as_str(),
                record.key.table,
                record.version as i64
            ],
        )?;

        if Self::find(conn, &record.key)?.is_some_and(|existing| record.is_same_revision(&existing)) {
            return Ok(WriteOutcome::Unchanged);
        }
        Self::put_row(conn, record)?;
        Ok(WriteOutcome::Applied)
    }

    fn put_row(conn: &Connection, record: &Record) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO records ({RECORD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(tenant_id, table_name, primary_key) DO UPDATE SET
                    fields = excluded.fields,
                    version = excluded.version,
                    checksum = excluded.checksum,
                    updated_at = excluded.updated_at,
                    tombstoned_at = excluded.tombstoned_at"
            ),
            params![
                record.key.tenant.as_str(),
                record.key.table,
                record.key.primary_key,
                serde_json::to_string(&record.fields)?,
                record.version as i64,
                record.checksum,
                record.updated_at,
                record.tombstoned_at,
            ],
        )?;
        Ok(())
    }

    fn fetch_page(
        conn: &Connection,
        tenant: &TenantId,
        table: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE tenant_id = ? AND table_name = ? AND version > ?
             ORDER BY version, primary_key
             LIMIT ?"
        ))?;
        let mut page = stmt
            .query_map(
                params![tenant.as_str(), table, cursor as i64, limit as i64],
                Self::parse_record,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if page.len() == limit {
            if let Some(last) = page.last().cloned() {
                let mut rest = conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE tenant_id = ? AND table_name = ? AND version = ? AND primary_key > ?
                     ORDER BY primary_key"
                ))?;
                let same_version = rest
                    .query_map(
                        params![tenant.as_str(), table, last.version as i64, last.key.primary_key],
                        Self::parse_record,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                page.extend(same_version);
            }
        }
        Ok(page)
    }
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    fn store_id(&self) -> StoreId {
        self.id
    }

    async fn ping(&self) -> Result<()> {
        let id = self.id;
        self.blocking(move |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|error| Error::unavailable(id, error.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn tenants(&self) -> Result<Vec<TenantId>> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT tenant_id FROM records ORDER BY tenant_id")?;
            let raw = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raw.into_iter().map(TenantId::new).collect()
        })
        .await
    }

    async fn fetch_changed_since(
        &self,
        tenant: &TenantId,
        table: &str,
        cursor: u64,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let (tenant, table) = (tenant.clone(), table.to_string());
        let limit = limit.max(1);
        self.blocking(move |conn| Self::fetch_page(conn, &tenant, &table, cursor, limit))
            .await
    }

    async fn get_many(
        &self,
        tenant: &TenantId,
        table: &str,
        primary_keys: &[String],
    ) -> Result<Vec<Record>> {
        let (tenant, table) = (tenant.clone(), table.to_string());
        let primary_keys = primary_keys.to_vec();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE tenant_id = ? AND table_name = ? AND primary_key = ?"
            ))?;
            let mut found = Vec::with_capacity(primary_keys.len());
            for pk in &primary_keys {
                if let Some(record) = stmt
                    .query_row(params![tenant.as_str(), table, pk], Self::parse_record)
                    .optional()?
                {
                    found.push(record);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn write(&self, key: &RecordKey, fields: Map<String, Value>) -> Result<Record> {
        let key = key.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let version = Self::next_version(&tx, &key.tenant, &key.table)?;
            let record = Record::new(key, fields, version, now_millis());
            Self::upsert_row(&tx, &record)?;
            tx.commit()?;
            Ok(record)
        })
        .await
    }

    async fn upsert(&self, record: &Record) -> Result<WriteOutcome> {
        let record = record.clone();
        self.blocking(move |conn| Self::upsert_row(conn, &record)).await
    }

    async fn tombstone(&self, key: &RecordKey) -> Result<Option<Record>> {
        let key = key.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let Some(existing) = Self::find(&tx, &key)? else {
                return Ok(None);
            };
            if existing.is_tombstoned() {
                return Ok(Some(existing));
            }
            let version = Self::next_version(&tx, &key.tenant, &key.table)?;
            let deleted = existing.tombstoned(version, now_millis());
            Self::upsert_row(&tx, &deleted)?;
            tx.commit()?;
            Ok(Some(deleted))
        })
        .await
    }

    async fn apply_batch(&self, records: &[Record]) -> Result<Vec<WriteOutcome>> {
        let records = records.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let outcomes = records
                .iter()
                .map(|record| Self::upsert_row(&tx, record))
                .collect::<Result<Vec<_>>>()?;
            tx.commit()?;
            Ok(outcomes)
        })
        .await
    }

    async fn restore(&self, rows: &[(RecordKey, Option<Record>)]) -> Result<()> {
        let rows = rows.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            for (key, previous) in &rows {
                match previous {
                    Some(record) => Self::put_row(&tx, record)?,
                    None => {
                        tx.execute(
                            "DELETE FROM records
                             WHERE tenant_id = ? AND table_name = ? AND primary_key = ?",
                            params![key.tenant.as_str(), key.table, key.primary_key],
                        )?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn apply_migration_step(&self, script: &str) -> Result<()> {
        let script = script.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(&script)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn purge_tombstones(&self, before: i64) -> Result<usize> {
        self.blocking(move |conn| {
            let purged = conn.execute(
                "DELETE FROM records WHERE tombstoned_at IS NOT NULL AND tombstoned_at < ?",
                params![before],
            )?;
            Ok(purged)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("clinic").unwrap()
    }

    fn key(pk: &str) -> RecordKey {
        RecordKey::new(tenant(), "appointments", pk).unwrap()
    }

    fn fields(slot: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("slot".into(), json!(slot));
        map.insert("meta".into(), json!({"room": 3, "tags": ["a", "b"]}));
        map
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_and_read_back_preserve_checksum() {
        let store = SqliteStore::open_in_memory(StoreId::Primary).unwrap();
        let written = store.write(&key("a1"), fields("09:00")).await.unwrap();
        let read = store.get(&key("a1")).await.unwrap().unwrap();
        assert_eq!(read, written);
        assert_eq!(read.expected_checksum(), read.checksum);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replicated_versions_advance_the_clock() {
        let store = SqliteStore::open_in_memory(StoreId::Secondary).unwrap();
        let replicated = Record::new(key("a1"), fields("09:00"), 40, 1);
        assert_eq!(store.upsert(&replicated).await.unwrap(), WriteOutcome::Applied);
        assert_eq!(store.upsert(&replicated).await.unwrap(), WriteOutcome::Unchanged);

        let local = store.write(&key("a2"), fields("10:00")).await.unwrap();
        assert_eq!(local.version, 41);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pages_never_split_a_shared_version() {
        let store = SqliteStore::open_in_memory(StoreId::Primary).unwrap();
        let batch: Vec<Record> = ["a", "b", "c"]
            .iter()
            .map(|pk| Record::new(key(pk), fields(pk), 5, 1))
            .chain(std::iter::once(Record::new(key("d"), fields("d"), 6, 1)))
            .collect();
        store.apply_batch(&batch).await.unwrap();

        let page = store
            .fetch_changed_since(&tenant(), "appointments", 0, 2)
            .await
            .unwrap();
        let pks: Vec<&str> = page.iter().map(|r| r.key.primary_key.as_str()).collect();
        assert_eq!(pks, vec!["a", "b", "c"]);

        let next = store
            .fetch_changed_since(&tenant(), "appointments", 5, 2)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].key.primary_key, "d");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_batch_leaves_no_partial_writes() {
        let store = SqliteStore::open_in_memory(StoreId::Primary).unwrap();
        store
            .apply_migration_step("CREATE TRIGGER reject_poison BEFORE INSERT ON records WHEN NEW.primary_key = 'poison' BEGIN SELECT RAISE(ABORT, 'poison'); END;")
            .await
            .unwrap();
        let batch = vec![
            Record::new(key("ok"), fields("1"), 1, 1),
            Record::new(key("poison"), fields("2"), 2, 1),
        ];
        assert!(store.apply_batch(&batch).await.is_err());
        assert!(store.get(&key("ok")).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tombstones_persist_and_purge() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("local.db");
        {
            let store = SqliteStore::open(StoreId::Secondary, &path).unwrap();
            store.write(&key("a1"), fields("09:00")).await.unwrap();
            store.tombstone(&key("a1")).await.unwrap();
        }
        let store = SqliteStore::open(StoreId::Secondary, &path).unwrap();
        let deleted = store.get(&key("a1")).await.unwrap().unwrap();
        assert!(deleted.is_tombstoned());
        assert_eq!(store.tenants().await.unwrap(), vec![tenant()]);

        let at = deleted.tombstoned_at.unwrap();
        assert_eq!(store.purge_tombstones(at + 1).await.unwrap(), 1);
        assert!(store.get(&key("a1")).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restore_puts_rows_back_and_drops_new_keys() {
        let store = SqliteStore::open_in_memory(StoreId::Secondary).unwrap();
        let before = store.write(&key("a1"), fields("09:00")).await.unwrap();
        store
            .apply_batch(&[
                Record::new(key("a1"), fields("10:00"), 7, 2),
                Record::new(key("a2"), fields("11:00"), 8, 2),
            ])
            .await
            .unwrap();

        store
            .restore(&[(key("a1"), Some(before.clone())), (key("a2"), None)])
            .await
            .unwrap();
        assert_eq!(store.get(&key("a1")).await.unwrap(), Some(before));
        assert!(store.get(&key("a2")).await.unwrap().is_none());

        // The clock keeps the highest version it has seen.
        let next = store.write(&key("a3"), fields("12:00")).await.unwrap();
        assert_eq!(next.version, 9);
    }
}
