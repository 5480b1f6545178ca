//! Sync conflict repository

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite uses i64 for versions

use std::collections::{BTreeMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension};

use super::{json_column, parse_column};
use crate::error::Result;
use crate::models::{Conflict, Record, ResolutionStatus, StoreId, TenantId};

const CONFLICT_COLUMNS: &str = "id, tenant_id, table_name, primary_key, primary_version,
    secondary_version, detected_at, strategy, origin, resolution_status, winner,
    primary_record, secondary_record, resolved_record, resolved_at, applied_at";

/// `SQLite` access to the `sync_conflicts` table
pub struct SqliteConflictRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteConflictRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_conflict(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conflict> {
        let tenant: String = row.get(1)?;
        let strategy: String = row.get(7)?;
        let origin: String = row.get(8)?;
        let status: String = row.get(9)?;
        let winner: Option<String> = row.get(10)?;
        Ok(Conflict {
            id: row.get(0)?,
            tenant: parse_column(1, &tenant)?,
            table: row.get(2)?,
            primary_key: row.get(3)?,
            primary_version: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
            secondary_version: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
            detected_at: row.get(6)?,
            strategy_applied: parse_column(7, &strategy)?,
            origin: parse_column(8, &origin)?,
            resolution_status: parse_column(9, &status)?,
            winner: winner.map(|raw| parse_column::<StoreId>(10, &raw)).transpose()?,
            primary_record: json_column(11, row.get(11)?)?,
            secondary_record: json_column(12, row.get(12)?)?,
            resolved_record: json_column(13, row.get(13)?)?,
            resolved_at: row.get(14)?,
            applied_at: row.get(15)?,
        })
    }

    fn query(&self, clause: &str, params: impl rusqlite::Params) -> Result<Vec<Conflict>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE {clause}"
        ))?;
        let conflicts = stmt
            .query_map(params, Self::parse_conflict)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(conflicts)
    }

    /// Persist a conflict; the `id` field is ignored and the new id returned
    pub fn insert(&self, conflict: &Conflict) -> Result<i64> {
        let encode = |record: Option<&Record>| record.map(serde_json::to_string).transpose();
        self.conn.execute(
            &format!(
                "INSERT INTO sync_conflicts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                CONFLICT_COLUMNS.trim_start_matches("id, ")
            ),
            params![
                conflict.tenant.as_str(),
                conflict.table,
                conflict.primary_key,
                conflict.primary_version.map(|v| v as i64),
                conflict.secondary_version.map(|v| v as i64),
                conflict.detected_at,
                conflict.strategy_applied.as_str(),
                conflict.origin.as_str(),
                conflict.resolution_status.as_str(),
                conflict.winner.map(StoreId::as_str),
                encode(conflict.primary_record.as_ref())?,
                encode(conflict.secondary_record.as_ref())?,
                encode(conflict.resolved_record.as_ref())?,
                conflict.resolved_at,
                conflict.applied_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, tenant: &TenantId, id: i64) -> Result<Option<Conflict>> {
        let conflict = self
            .conn
            .query_row(
                &format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE tenant_id = ? AND id = ?"),
                params![tenant.as_str(), id],
                Self::parse_conflict,
            )
            .optional()?;
        Ok(conflict)
    }

    /// Conflicts of a tenant, optionally narrowed to one status, oldest first
    pub fn list(
        &self,
        tenant: &TenantId,
        status: Option<ResolutionStatus>,
        limit: usize,
    ) -> Result<Vec<Conflict>> {
        let limit = limit as i64;
        match status {
            Some(status) => self.query(
                "tenant_id = ? AND resolution_status = ? ORDER BY id LIMIT ?",
                params![tenant.as_str(), status.as_str(), limit],
            ),
            None => self.query("tenant_id = ? ORDER BY id LIMIT ?", params![tenant.as_str(), limit]),
        }
    }

    /// Primary keys frozen by a pending manual conflict
    pub fn frozen_keys(&self, tenant: &TenantId, table: &str) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT primary_key FROM sync_conflicts
             WHERE tenant_id = ? AND table_name = ? AND resolution_status = 'pending_manual'",
        )?;
        let keys = stmt
            .query_map(params![tenant.as_str(), table], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(keys)
    }

    /// Operator resolutions not yet written to both stores
    pub fn awaiting_apply(&self, tenant: &TenantId, table: &str) -> Result<Vec<Conflict>> {
        self.query(
            "tenant_id = ? AND table_name = ? AND resolution_status = 'resolved_manual'
             AND applied_at IS NULL ORDER BY id",
            params![tenant.as_str(), table],
        )
    }

    /// Record the operator's choice; only pending conflicts change
    pub fn mark_resolved(
        &self,
        tenant: &TenantId,
        id: i64,
        winner: Option<StoreId>,
        resolved: &Record,
        at: i64,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE sync_conflicts
             SET resolution_status = 'resolved_manual', winner = ?, resolved_record = ?, resolved_at = ?
             WHERE tenant_id = ? AND id = ? AND resolution_status = 'pending_manual'",
            params![
                winner.map(StoreId::as_str),
                serde_json::to_string(resolved)?,
                at,
                tenant.as_str(),
                id
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn mark_applied(&self, id: i64, at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_conflicts SET applied_at = ? WHERE id = ? AND applied_at IS NULL",
            params![at, id],
        )?;
        Ok(())
    }

    /// Number of conflicts per resolution status for a tenant
    pub fn count_by_status(&self, tenant: &TenantId) -> Result<BTreeMap<String, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT resolution_status, COUNT(*) FROM sync_conflicts
             WHERE tenant_id = ? GROUP BY resolution_status",
        )?;
        let counts = stmt
            .query_map(params![tenant.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{json, Map};

    use super::*;
    use crate::db::Database;
    use crate::models::{ConflictOrigin, ConflictStrategy, RecordKey};

    fn tenant() -> TenantId {
        TenantId::new("clinic").unwrap()
    }

    fn record(version: u64, name: &str) -> Record {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(name));
        Record::new(RecordKey::new(tenant(), "patients", "p1").unwrap(), fields, version, 10)
    }

    fn pending() -> Conflict {
        Conflict {
            id: 0,
            tenant: tenant(),
            table: "patients".into(),
            primary_key: "p1".into(),
            primary_version: Some(5),
            secondary_version: Some(5),
            detected_at: 100,
            strategy_applied: ConflictStrategy::Manual,
            origin: ConflictOrigin::SyncPass,
            resolution_status: ResolutionStatus::PendingManual,
            winner: None,
            primary_record: Some(record(5, "Ana")),
            secondary_record: Some(record(5, "Anna")),
            resolved_record: None,
            resolved_at: None,
            applied_at: None,
        }
    }

    #[test]
    fn insert_and_read_back_round_trips_records() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteConflictRepository::new(db.connection());
        let id = repo.insert(&pending()).unwrap();

        let stored = repo.get(&tenant(), id).unwrap().unwrap();
        assert_eq!(stored, Conflict { id, ..pending() });
        assert!(repo.get(&TenantId::new("other").unwrap(), id).unwrap().is_none());
    }

    #[test]
    fn pending_conflicts_freeze_their_key_until_resolved() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteConflictRepository::new(db.connection());
        let id = repo.insert(&pending()).unwrap();
        assert!(repo.frozen_keys(&tenant(), "patients").unwrap().contains("p1"));

        assert!(repo
            .mark_resolved(&tenant(), id, Some(StoreId::Secondary), &record(5, "Anna"), 200)
            .unwrap());
        assert!(!repo
            .mark_resolved(&tenant(), id, Some(StoreId::Primary), &record(5, "Ana"), 300)
            .unwrap());
        assert!(repo.frozen_keys(&tenant(), "patients").unwrap().is_empty());

        let awaiting = repo.awaiting_apply(&tenant(), "patients").unwrap();
        assert_eq!(awaiting.len(), 1);
        assert_eq!(awaiting[0].winner, Some(StoreId::Secondary));

        repo.mark_applied(id, 400).unwrap();
        assert!(repo.awaiting_apply(&tenant(), "patients").unwrap().is_empty());

        let counts = repo.count_by_status(&tenant()).unwrap();
        assert_eq!(counts.get("resolved_manual"), Some(&1));
    }
}
