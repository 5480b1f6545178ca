//! Lock-free counters read by status reporting

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct SyncMetrics {
    passes: AtomicU64,
    batches_committed: AtomicU64,
    batches_failed: AtomicU64,
    records_written: AtomicU64,
    conflicts_auto: AtomicU64,
    conflicts_manual: AtomicU64,
    operations_queued: AtomicU64,
    operations_replayed: AtomicU64,
    operations_escalated: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncMetricsSnapshot {
    pub passes: u64,
    pub batches_committed: u64,
    pub batches_failed: u64,
    pub records_written: u64,
    pub conflicts_auto: u64,
    pub conflicts_manual: u64,
    pub operations_queued: u64,
    pub operations_replayed: u64,
    pub operations_escalated: u64,
}

impl SyncMetrics {
    pub fn record_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_committed(&self, records_written: u64, auto: u64, manual: u64) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.records_written.fetch_add(records_written, Ordering::Relaxed);
        self.conflicts_auto.fetch_add(auto, Ordering::Relaxed);
        self.conflicts_manual.fetch_add(manual, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation_queued(&self) {
        self.operations_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation_replayed(&self) {
        self.operations_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation_escalated(&self) {
        self.operations_escalated.fetch_add(1, Ordering::Relaxed);
        self.conflicts_manual.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            conflicts_auto: self.conflicts_auto.load(Ordering::Relaxed),
            conflicts_manual: self.conflicts_manual.load(Ordering::Relaxed),
            operations_queued: self.operations_queued.load(Ordering::Relaxed),
            operations_replayed: self.operations_replayed.load(Ordering::Relaxed),
            operations_escalated: self.operations_escalated.load(Ordering::Relaxed),
        }
    }
}
