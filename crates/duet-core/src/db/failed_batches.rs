//! Failed batch log

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // SQLite uses i64 for versions

use rusqlite::{params, Connection};
use serde::Serialize;

use super::parse_column;
use crate::error::Result;
use crate::models::TenantId;

/// A batch whose commit exhausted its retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedBatch {
    pub id: i64,
    pub tenant: TenantId,
    pub table: String,
    /// Cursors the batch started from; they were left in place
    pub primary_cursor: u64,
    pub secondary_cursor: u64,
    pub record_count: usize,
    pub attempts: u32,
    pub error: String,
    pub failed_at: i64,
}

pub struct SqliteFailedBatchRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteFailedBatchRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn record(&self, batch: &FailedBatch) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO failed_batches
                (tenant_id, table_name, primary_cursor, secondary_cursor, record_count, attempts, error, failed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                batch.tenant.as_str(),
                batch.table,
                batch.primary_cursor as i64,
                batch.secondary_cursor as i64,
                batch.record_count as i64,
                batch.attempts,
                batch.error,
                batch.failed_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent failures first
    pub fn list(&self, tenant: &TenantId, limit: usize) -> Result<Vec<FailedBatch>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, table_name, primary_cursor, secondary_cursor, record_count,
                    attempts, error, failed_at
             FROM failed_batches WHERE tenant_id = ?
             ORDER BY failed_at DESC, id DESC LIMIT ?",
        )?;
        let batches = stmt
            .query_map(params![tenant.as_str(), limit as i64], |row| {
                let tenant: String = row.get(1)?;
                Ok(FailedBatch {
                    id: row.get(0)?,
                    tenant: parse_column(1, &tenant)?,
                    table: row.get(2)?,
                    primary_cursor: row.get::<_, i64>(3)? as u64,
                    secondary_cursor: row.get::<_, i64>(4)? as u64,
                    record_count: row.get::<_, i64>(5)? as usize,
                    attempts: row.get(6)?,
                    error: row.get(7)?,
                    failed_at: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(batches)
    }
}
