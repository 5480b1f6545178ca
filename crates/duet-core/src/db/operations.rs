//! Offline operation log repository

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite uses i64 for counts

use rusqlite::{params, Connection};
use serde::Serialize;

use super::parse_column;
use crate::error::Result;
use crate::models::{OfflineOperation, OperationKind, OperationStatus, Record, TenantId};

const OPERATION_COLUMNS: &str = "id, tenant_id, table_name, primary_key, op, payload, sequence_no,
    created_at, attempt_count, status, last_error, base_checksum";

/// Row of the queue statistics breakdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationCount {
    pub status: OperationStatus,
    pub op: OperationKind,
    pub count: u64,
}

/// `SQLite` access to the `offline_operations` table
pub struct SqliteOperationRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteOperationRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<OfflineOperation> {
        let tenant: String = row.get(1)?;
        let op: String = row.get(4)?;
        let payload: String = row.get(5)?;
        let status: String = row.get(9)?;
        let payload: Record = serde_json::from_str(&payload).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(error))
        })?;
        Ok(OfflineOperation {
            id: row.get(0)?,
            tenant: parse_column(1, &tenant)?,
            table: row.get(2)?,
            primary_key: row.get(3)?,
            op: parse_column(4, &op)?,
            payload,
            sequence_no: row.get(6)?,
            created_at: row.get(7)?,
            attempt_count: row.get(8)?,
            status: parse_column(9, &status)?,
            last_error: row.get(10)?,
            base_checksum: row.get(11)?,
        })
    }

    fn query(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<OfflineOperation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM offline_operations WHERE {clause}"
        ))?;
        let operations = stmt
            .query_map(params, Self::parse_operation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(operations)
    }

    /// Append an operation with the next sequence number of its partition.
    ///
    /// Numbers come from a per-partition counter that only ever grows, so a
    /// cleared or purged tail is never handed out again. Callers run this
    /// inside the same transaction as any read that must observe the new
    /// sequence number.
    pub fn enqueue(
        &self,
        op: OperationKind,
        payload: &Record,
        base_checksum: Option<&str>,
        created_at: i64,
    ) -> Result<OfflineOperation> {
        let key = &payload.key;
        let sequence_no: i64 = self.conn.query_row(
            "INSERT INTO offline_sequences (tenant_id, table_name, last_sequence) VALUES (?, ?, 1)
             ON CONFLICT(tenant_id, table_name) DO UPDATE SET last_sequence = last_sequence + 1
             RETURNING last_sequence",
            params![key.tenant.as_str(), key.table],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO offline_operations
                (tenant_id, table_name, primary_key, op, payload, sequence_no, created_at, status,
                 base_checksum)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
            params![
                key.tenant.as_str(),
                key.table,
                key.primary_key,
                op.as_str(),
                serde_json::to_string(payload)?,
                sequence_no,
                created_at,
                base_checksum,
            ],
        )?;
        Ok(OfflineOperation {
            id: self.conn.last_insert_rowid(),
            tenant: key.tenant.clone(),
            table: key.table.clone(),
            primary_key: key.primary_key.clone(),
            op,
            payload: payload.clone(),
            base_checksum: base_checksum.map(str::to_string),
            sequence_no,
            created_at,
            attempt_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
        })
    }

    /// Pending operations ordered by partition, then `sequence_no`
    pub fn pending(&self, tenant: Option<&TenantId>) -> Result<Vec<OfflineOperation>> {
        match tenant {
            Some(tenant) => self.query(
                "status = 'pending' AND tenant_id = ? ORDER BY tenant_id, table_name, sequence_no",
                params![tenant.as_str()],
            ),
            None => self.query(
                "status = 'pending' ORDER BY tenant_id, table_name, sequence_no",
                [],
            ),
        }
    }

    /// Highest sequence number already applied in a partition, zero if none
    pub fn max_applied_sequence(&self, tenant: &TenantId, table: &str) -> Result<i64> {
        let max = self.conn.query_row(
            "SELECT COALESCE(MAX(sequence_no), 0) FROM offline_operations
             WHERE tenant_id = ? AND table_name = ? AND status = 'applied'",
            params![tenant.as_str(), table],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Operations of a tenant, optionally one status, newest sequence last
    pub fn list(
        &self,
        tenant: &TenantId,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        let limit = limit as i64;
        match status {
            Some(status) => self.query(
                "tenant_id = ? AND status = ? ORDER BY table_name, sequence_no LIMIT ?",
                params![tenant.as_str(), status.as_str(), limit],
            ),
            None => self.query(
                "tenant_id = ? ORDER BY table_name, sequence_no LIMIT ?",
                params![tenant.as_str(), limit],
            ),
        }
    }

    pub fn mark_applied(&self, id: i64, attempt_count: u32, at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE offline_operations
             SET status = 'applied', attempt_count = ?, last_error = NULL, applied_at = ?
             WHERE id = ?",
            params![attempt_count, at, id],
        )?;
        Ok(())
    }

    pub fn mark_failed(&self, id: i64, attempt_count: u32, error: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE offline_operations SET status = 'failed', attempt_count = ?, last_error = ?
             WHERE id = ?",
            params![attempt_count, error, id],
        )?;
        Ok(())
    }

    /// Fail every pending operation for one key; returns how many changed
    pub fn fail_pending_for_key(
        &self,
        tenant: &TenantId,
        table: &str,
        primary_key: &str,
        reason: &str,
    ) -> Result<usize> {
        let rows = self.conn.execute(
            "UPDATE offline_operations SET status = 'failed', last_error = ?
             WHERE tenant_id = ? AND table_name = ? AND primary_key = ? AND status = 'pending'",
            params![reason, tenant.as_str(), table, primary_key],
        )?;
        Ok(rows)
    }

    /// Counts grouped by status and operation kind
    pub fn stats(&self, tenant: &TenantId) -> Result<Vec<OperationCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT status, op, COUNT(*) FROM offline_operations
             WHERE tenant_id = ? GROUP BY status, op ORDER BY status, op",
        )?;
        let counts = stmt
            .query_map(params![tenant.as_str()], |row| {
                let status: String = row.get(0)?;
                let op: String = row.get(1)?;
                Ok(OperationCount {
                    status: parse_column(0, &status)?,
                    op: parse_column(1, &op)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    pub fn count_pending(&self, tenant: &TenantId) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM offline_operations WHERE tenant_id = ? AND status = 'pending'",
            params![tenant.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Drop pending and failed operations of a tenant, optionally one table
    pub fn clear(&self, tenant: &TenantId, table: Option<&str>) -> Result<usize> {
        let rows = match table {
            Some(table) => self.conn.execute(
                "DELETE FROM offline_operations
                 WHERE tenant_id = ? AND table_name = ? AND status IN ('pending', 'failed')",
                params![tenant.as_str(), table],
            )?,
            None => self.conn.execute(
                "DELETE FROM offline_operations
                 WHERE tenant_id = ? AND status IN ('pending', 'failed')",
                params![tenant.as_str()],
            )?,
        };
        Ok(rows)
    }

    /// Delete applied operations older than `before` (unix ms).
    ///
    /// The newest applied row of each partition is kept so the ordering
    /// check never restarts below what was already replayed.
    pub fn purge_applied(&self, before: i64) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM offline_operations
             WHERE status = 'applied' AND applied_at < ?
               AND id NOT IN (
                   SELECT id FROM offline_operations AS latest
                   WHERE latest.status = 'applied'
                     AND latest.sequence_no = (
                         SELECT MAX(sequence_no) FROM offline_operations AS inner_ops
                         WHERE inner_ops.tenant_id = latest.tenant_id
                           AND inner_ops.table_name = latest.table_name
                           AND inner_ops.status = 'applied'
                     )
               )",
            params![before],
        )?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    use super::*;
    use crate::db::Database;
    use crate::models::RecordKey;

    fn tenant() -> TenantId {
        TenantId::new("clinic").unwrap()
    }

    fn record(table: &str, pk: &str, version: u64) -> Record {
        let mut fields = Map::new();
        fields.insert("slot".into(), json!(pk));
        Record::new(RecordKey::new(tenant(), table, pk).unwrap(), fields, version, 1)
    }

    #[test]
    fn sequence_numbers_are_per_partition() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOperationRepository::new(db.connection());
        let a1 = repo.enqueue(OperationKind::Insert, &record("appointments", "a", 1), None, 1).unwrap();
        let a2 = repo.enqueue(OperationKind::Update, &record("appointments", "a", 2), None, 2).unwrap();
        let p1 = repo.enqueue(OperationKind::Insert, &record("patients", "p", 1), None, 3).unwrap();
        assert_eq!((a1.sequence_no, a2.sequence_no, p1.sequence_no), (1, 2, 1));

        let pending = repo.pending(Some(&tenant())).unwrap();
        let order: Vec<(String, i64)> = pending
            .iter()
            .map(|op| (op.table.clone(), op.sequence_no))
            .collect();
        assert_eq!(
            order,
            vec![
                ("appointments".to_string(), 1),
                ("appointments".to_string(), 2),
                ("patients".to_string(), 1)
            ]
        );
        assert_eq!(pending[1].payload, record("appointments", "a", 2));
    }

    #[test]
    fn status_transitions_and_stats() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOperationRepository::new(db.connection());
        let first = repo.enqueue(OperationKind::Insert, &record("appointments", "a", 1), None, 1).unwrap();
        let second = repo.enqueue(OperationKind::Delete, &record("appointments", "b", 2), None, 2).unwrap();

        repo.mark_applied(first.id, 1, 10).unwrap();
        repo.mark_failed(second.id, 3, "primary unavailable").unwrap();
        assert_eq!(repo.max_applied_sequence(&tenant(), "appointments").unwrap(), 1);
        assert_eq!(repo.count_pending(&tenant()).unwrap(), 0);

        let stats = repo.stats(&tenant()).unwrap();
        assert_eq!(
            stats,
            vec![
                OperationCount {
                    status: OperationStatus::Applied,
                    op: OperationKind::Insert,
                    count: 1
                },
                OperationCount {
                    status: OperationStatus::Failed,
                    op: OperationKind::Delete,
                    count: 1
                },
            ]
        );

        let failed = repo.list(&tenant(), Some(OperationStatus::Failed), 10).unwrap();
        assert_eq!(failed[0].attempt_count, 3);
        assert_eq!(failed[0].last_error.as_deref(), Some("primary unavailable"));
    }

    #[test]
    fn clear_keeps_applied_history() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOperationRepository::new(db.connection());
        let applied = repo.enqueue(OperationKind::Insert, &record("appointments", "a", 1), None, 1).unwrap();
        repo.mark_applied(applied.id, 1, 5).unwrap();
        repo.enqueue(OperationKind::Update, &record("appointments", "a", 2), None, 2).unwrap();
        repo.enqueue(OperationKind::Insert, &record("patients", "p", 1), None, 3).unwrap();

        assert_eq!(repo.clear(&tenant(), Some("patients")).unwrap(), 1);
        assert_eq!(repo.clear(&tenant(), None).unwrap(), 1);
        assert_eq!(repo.list(&tenant(), None, 10).unwrap().len(), 1);
    }

    #[test]
    fn purge_applied_keeps_partition_high_water_mark() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOperationRepository::new(db.connection());
        for version in 1..=3 {
            let op = repo
                .enqueue(OperationKind::Update, &record("appointments", "a", version), None, 1)
                .unwrap();
            repo.mark_applied(op.id, 1, 10).unwrap();
        }

        assert_eq!(repo.purge_applied(11).unwrap(), 2);
        assert_eq!(repo.max_applied_sequence(&tenant(), "appointments").unwrap(), 3);
        let next = repo
            .enqueue(OperationKind::Update, &record("appointments", "a", 4), None, 20)
            .unwrap();
        assert_eq!(next.sequence_no, 4);
    }

    #[test]
    fn cleared_tail_does_not_reuse_sequence_numbers() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteOperationRepository::new(db.connection());
        for version in 1..=3 {
            repo.enqueue(OperationKind::Update, &record("appointments", "a", version), None, 1)
                .unwrap();
        }
        assert_eq!(repo.clear(&tenant(), Some("appointments")).unwrap(), 3);

        let next = repo
            .enqueue(OperationKind::Update, &record("appointments", "a", 4), Some("abc"), 2)
            .unwrap();
        assert_eq!(next.sequence_no, 4);
        let stored = repo.pending(Some(&tenant())).unwrap();
        assert_eq!(stored[0].base_checksum.as_deref(), Some("abc"));
    }
}
