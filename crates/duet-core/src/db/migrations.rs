//! Control database schema migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 5;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        apply(conn, 1, V1)?;
    }
    if version < 2 {
        apply(conn, 2, V2)?;
    }
    if version < 3 {
        apply(conn, 3, V3)?;
    }
    if version < 4 {
        apply(conn, 4, V4)?;
    }
    if version < 5 {
        apply(conn, 5, V5)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

fn apply(conn: &Connection, version: i32, statements: &str) -> Result<()> {
    conn.execute_batch("BEGIN TRANSACTION")?;

    let result = conn.execute_batch(statements).and_then(|()| {
        conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
            .map(|_| ())
    });
    if let Err(e) = result {
        conn.execute_batch("ROLLBACK").ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute_batch("COMMIT") {
        conn.execute_batch("ROLLBACK").ok();
        return Err(e.into());
    }

    tracing::info!("Migrated control database to version {version} of {CURRENT_VERSION}");
    Ok(())
}

/// Version 1: cursors, conflicts and the offline operation log
const V1: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS sync_cursors (
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        store TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (tenant_id, table_name, store)
    );

    CREATE TABLE IF NOT EXISTS sync_conflicts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        primary_version INTEGER,
        secondary_version INTEGER,
        detected_at INTEGER NOT NULL,
        strategy TEXT NOT NULL,
        origin TEXT NOT NULL,
        resolution_status TEXT NOT NULL,
        winner TEXT,
        primary_record TEXT,
        secondary_record TEXT,
        resolved_record TEXT,
        resolved_at INTEGER,
        applied_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_tenant_status
        ON sync_conflicts(tenant_id, resolution_status);
    CREATE INDEX IF NOT EXISTS idx_sync_conflicts_key
        ON sync_conflicts(tenant_id, table_name, primary_key);

    CREATE TABLE IF NOT EXISTS offline_operations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        op TEXT NOT NULL,
        payload TEXT NOT NULL,
        sequence_no INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        last_error TEXT,
        applied_at INTEGER,
        UNIQUE (tenant_id, table_name, sequence_no)
    );
    CREATE INDEX IF NOT EXISTS idx_offline_operations_status
        ON offline_operations(status, tenant_id, table_name, sequence_no);
";

/// Version 2: failed batch log
const V2: &str = "
    CREATE TABLE IF NOT EXISTS failed_batches (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        primary_cursor INTEGER NOT NULL,
        secondary_cursor INTEGER NOT NULL,
        record_count INTEGER NOT NULL,
        attempts INTEGER NOT NULL,
        error TEXT NOT NULL,
        failed_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_failed_batches_tenant
        ON failed_batches(tenant_id, failed_at DESC);
";

/// Version 3: per-store migration ledger
const V3: &str = "
    CREATE TABLE IF NOT EXISTS migration_applications (
        store TEXT NOT NULL,
        version INTEGER NOT NULL,
        checksum TEXT NOT NULL,
        applied_at INTEGER NOT NULL,
        PRIMARY KEY (store, version)
    );

    CREATE TABLE IF NOT EXISTS migration_halts (
        store TEXT PRIMARY KEY,
        reason TEXT NOT NULL,
        halted_at INTEGER NOT NULL
    );
";

/// Version 4: last content both stores agreed on, per record
const V4: &str = "
    CREATE TABLE IF NOT EXISTS sync_baselines (
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        primary_key TEXT NOT NULL,
        checksum TEXT NOT NULL,
        synced_at INTEGER NOT NULL,
        PRIMARY KEY (tenant_id, table_name, primary_key)
    );
";

/// Version 5: persistent sequence counters and replay base checksums
const V5: &str = "
    CREATE TABLE IF NOT EXISTS offline_sequences (
        tenant_id TEXT NOT NULL,
        table_name TEXT NOT NULL,
        last_sequence INTEGER NOT NULL,
        PRIMARY KEY (tenant_id, table_name)
    );
    INSERT OR IGNORE INTO offline_sequences (tenant_id, table_name, last_sequence)
        SELECT tenant_id, table_name, MAX(sequence_no) FROM offline_operations
        GROUP BY tenant_id, table_name;

    ALTER TABLE offline_operations ADD COLUMN base_checksum TEXT;
";
