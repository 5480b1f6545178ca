//! Sync cursor repository

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite uses i64 for versions

use rusqlite::{params, Connection, OptionalExtension};

use super::parse_column;
use crate::error::Result;
use crate::models::{Cursor, StoreId, TenantId};

/// Trait for watermark storage
pub trait CursorRepository {
    /// Cursor for one side of a (tenant, table); zero when never advanced
    fn get(&self, tenant: &TenantId, table: &str, store: StoreId) -> Result<Cursor>;

    /// Every stored cursor of a tenant
    fn list(&self, tenant: &TenantId) -> Result<Vec<Cursor>>;

    /// Move the cursor to `version` if that is ahead of it; returns the stored value
    fn advance(
        &self,
        tenant: &TenantId,
        table: &str,
        store: StoreId,
        version: u64,
        now: i64,
    ) -> Result<u64>;
}

/// `SQLite` implementation of `CursorRepository`
pub struct SqliteCursorRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCursorRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_cursor(row: &rusqlite::Row<'_>) -> rusqlite::Result<Cursor> {
        let tenant: String = row.get(0)?;
        let store: String = row.get(2)?;
        Ok(Cursor {
            tenant: parse_column(0, &tenant)?,
            table: row.get(1)?,
            store: parse_column(2, &store)?,
            version: row.get::<_, i64>(3)? as u64,
            updated_at: row.get(4)?,
        })
    }
}

impl CursorRepository for SqliteCursorRepository<'_> {
    fn get(&self, tenant: &TenantId, table: &str, store: StoreId) -> Result<Cursor> {
        let found = self
            .conn
            .query_row(
                "SELECT tenant_id, table_name, store, version, updated_at FROM sync_cursors
                 WHERE tenant_id = ? AND table_name = ? AND store = ?",
                params![tenant.as_str(), table, store.as_str()],
                Self::parse_cursor,
            )
            .optional()?;

        Ok(found.unwrap_or_else(|| Cursor {
            tenant: tenant.clone(),
            table: table.to_string(),
            store,
            version: 0,
            updated_at: 0,
        }))
    }

    fn list(&self, tenant: &TenantId) -> Result<Vec<Cursor>> {
        let mut stmt = self.conn.prepare(
            "SELECT tenant_id, table_name, store, version, updated_at FROM sync_cursors
             WHERE tenant_id = ?
             ORDER BY table_name, store",
        )?;
        let cursors = stmt
            .query_map(params![tenant.as_str()], Self::parse_cursor)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(cursors)
    }

    fn advance(
        &self,
        tenant: &TenantId,
        table: &str,
        store: StoreId,
        version: u64,
        now: i64,
    ) -> Result<u64> {
        let stored: i64 = self.conn.query_row(
            "INSERT INTO sync_cursors (tenant_id, table_name, store, version, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(tenant_id, table_name, store) DO UPDATE SET
                updated_at = CASE WHEN excluded.version > version THEN excluded.updated_at ELSE updated_at END,
                version = MAX(version, excluded.version)
             RETURNING version",
            params![tenant.as_str(), table, store.as_str(), version as i64, now],
            |row| row.get(0),
        )?;
        Ok(stored as u64)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::Database;

    fn tenant() -> TenantId {
        TenantId::new("clinic").unwrap()
    }

    #[test]
    fn missing_cursor_reads_as_zero() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteCursorRepository::new(db.connection());
        let cursor = repo.get(&tenant(), "patients", StoreId::Primary).unwrap();
        assert_eq!(cursor.version, 0);
    }

    #[test]
    fn advance_never_regresses() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteCursorRepository::new(db.connection());

        assert_eq!(repo.advance(&tenant(), "patients", StoreId::Primary, 10, 1).unwrap(), 10);
        assert_eq!(repo.advance(&tenant(), "patients", StoreId::Primary, 4, 2).unwrap(), 10);
        assert_eq!(repo.advance(&tenant(), "patients", StoreId::Primary, 12, 3).unwrap(), 12);

        let cursor = repo.get(&tenant(), "patients", StoreId::Primary).unwrap();
        assert_eq!((cursor.version, cursor.updated_at), (12, 3));
        assert_eq!(repo.get(&tenant(), "patients", StoreId::Secondary).unwrap().version, 0);
    }

    #[test]
    fn cursors_are_scoped_per_tenant() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteCursorRepository::new(db.connection());
        let other = TenantId::new("other").unwrap();
        repo.advance(&tenant(), "patients", StoreId::Primary, 3, 1).unwrap();
        repo.advance(&other, "patients", StoreId::Primary, 9, 1).unwrap();

        let listed = repo.list(&tenant()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, 3);
    }
}
