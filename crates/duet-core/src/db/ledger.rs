//! Per-store migration ledger tables

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{MigrationApplication, StoreId};

pub struct SqliteLedgerRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteLedgerRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Applications recorded for a store, ascending by version
    pub fn applications(&self, store: StoreId) -> Result<Vec<MigrationApplication>> {
        let mut stmt = self.conn.prepare(
            "SELECT version, checksum, applied_at FROM migration_applications
             WHERE store = ? ORDER BY version",
        )?;
        let applications = stmt
            .query_map(params![store.as_str()], |row| {
                Ok(MigrationApplication {
                    version: row.get(0)?,
                    store,
                    checksum: row.get(1)?,
                    applied_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(applications)
    }

    pub fn record(&self, application: &MigrationApplication) -> Result<()> {
        self.conn.execute(
            "INSERT INTO migration_applications (store, version, checksum, applied_at)
             VALUES (?, ?, ?, ?)",
            params![
                application.store.as_str(),
                application.version,
                application.checksum,
                application.applied_at
            ],
        )?;
        Ok(())
    }

    pub fn remove(&self, store: StoreId, version: u32) -> Result<()> {
        self.conn.execute(
            "DELETE FROM migration_applications WHERE store = ? AND version = ?",
            params![store.as_str(), version],
        )?;
        Ok(())
    }

    /// Halt migrations on a store; the first reason recorded is kept
    pub fn halt(&self, store: StoreId, reason: &str, at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO migration_halts (store, reason, halted_at) VALUES (?, ?, ?)",
            params![store.as_str(), reason, at],
        )?;
        Ok(())
    }

    pub fn halt_reason(&self, store: StoreId) -> Result<Option<String>> {
        let reason = self
            .conn
            .query_row(
                "SELECT reason FROM migration_halts WHERE store = ?",
                params![store.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(reason)
    }

    /// Returns whether a halt was present
    pub fn clear_halt(&self, store: StoreId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM migration_halts WHERE store = ?",
            params![store.as_str()],
        )?;
        Ok(rows > 0)
    }
}
