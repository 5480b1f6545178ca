//! Pass outcome reporting

use serde::Serialize;
use uuid::Uuid;

use crate::models::TenantId;

/// What one table contributed to a pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub table: String,
    pub batches: u32,
    pub pulled_primary: usize,
    pub pulled_secondary: usize,
    pub written_primary: usize,
    pub written_secondary: usize,
    /// Changes that needed no write: identical pairs and echoed copies
    pub converged: usize,
    pub conflicts_auto: usize,
    pub conflicts_manual: usize,
    pub resolutions_applied: usize,
    /// Changes skipped because a pending manual conflict froze their key
    pub skipped_frozen: usize,
    /// Error of the batch that exhausted its retries, if any
    pub failed: Option<String>,
}

impl TableReport {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Self::default()
        }
    }

    pub const fn is_failed(&self) -> bool {
        self.failed.is_some()
    }
}

/// Outcome of one sync pass over every table of a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub tenant: TenantId,
    pub started_at: i64,
    pub finished_at: i64,
    pub tables: Vec<TableReport>,
}

impl PassReport {
    pub fn table(&self, table: &str) -> Option<&TableReport> {
        self.tables.iter().find(|report| report.table == table)
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|report| report.is_failed())
            .map(|report| report.table.as_str())
            .collect()
    }

    pub fn total_written(&self) -> usize {
        self.tables
            .iter()
            .map(|report| report.written_primary + report.written_secondary)
            .sum()
    }

    pub fn total_conflicts(&self) -> usize {
        self.tables
            .iter()
            .map(|report| report.conflicts_auto + report.conflicts_manual)
            .sum()
    }
}
