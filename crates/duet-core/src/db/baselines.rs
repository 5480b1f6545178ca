//! Last synced content per record

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, Connection};

use crate::error::Result;
use crate::models::TenantId;

/// `SQLite` access to `sync_baselines`.
///
/// A baseline is the checksum both stores held after the last batch that
/// touched the record; a copy whose checksum still equals it has not
/// changed since, whatever its version says.
pub struct SqliteBaselineRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteBaselineRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Baselines of the given keys; keys never synced are omitted
    pub fn get_many(
        &self,
        tenant: &TenantId,
        table: &str,
        primary_keys: &[String],
    ) -> Result<HashMap<String, String>> {
        let mut found = HashMap::with_capacity(primary_keys.len());
        // Stay well below SQLite's bound parameter limit.
        for chunk in primary_keys.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = self.conn.prepare(&format!(
                "SELECT primary_key, checksum FROM sync_baselines
                 WHERE tenant_id = ? AND table_name = ? AND primary_key IN ({placeholders})"
            ))?;
            let values = [tenant.as_str(), table]
                .into_iter()
                .chain(chunk.iter().map(String::as_str));
            let rows = stmt.query_map(params_from_iter(values), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (primary_key, checksum) = row?;
                found.insert(primary_key, checksum);
            }
        }
        Ok(found)
    }

    pub fn upsert(
        &self,
        tenant: &TenantId,
        table: &str,
        primary_key: &str,
        checksum: &str,
        at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_baselines (tenant_id, table_name, primary_key, checksum, synced_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (tenant_id, table_name, primary_key)
             DO UPDATE SET checksum = excluded.checksum, synced_at = excluded.synced_at",
            params![tenant.as_str(), table, primary_key, checksum, at],
        )?;
        Ok(())
    }
}
