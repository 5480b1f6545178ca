//! Change tracker: per (tenant, table, store) watermarks

use crate::db::{CommittedBatch, ControlDb};
use crate::error::Result;
use crate::models::{Cursor, StoreId, TenantId};

/// Read side of the cursor table plus the single commit-time write path.
///
/// Cursors only move through [`ChangeTracker::commit`], which advances both
/// sides with advance-if-greater semantics, so concurrent or repeated
/// commits of the same batch can never move a cursor backwards.
#[derive(Clone)]
pub struct ChangeTracker {
    control: ControlDb,
}

impl ChangeTracker {
    pub const fn new(control: ControlDb) -> Self {
        Self { control }
    }

    pub async fn cursor_for(&self, tenant: &TenantId, table: &str, store: StoreId) -> Result<u64> {
        Ok(self.control.cursor(tenant, table, store).await?.version)
    }

    /// Both cursors of a shard as (primary, secondary)
    pub async fn cursors_for(&self, tenant: &TenantId, table: &str) -> Result<(u64, u64)> {
        let primary = self.cursor_for(tenant, table, StoreId::Primary).await?;
        let secondary = self.cursor_for(tenant, table, StoreId::Secondary).await?;
        Ok((primary, secondary))
    }

    pub async fn cursors(&self, tenant: &TenantId) -> Result<Vec<Cursor>> {
        self.control.cursors(tenant).await
    }

    /// Advance both cursors and persist the batch's conflict bookkeeping.
    ///
    /// Must only be called after both stores accepted the batch.
    pub async fn commit(
        &self,
        tenant: &TenantId,
        table: &str,
        batch: &CommittedBatch,
        at: i64,
    ) -> Result<Vec<i64>> {
        self.control.record_committed_batch(tenant, table, batch, at).await
    }
}
