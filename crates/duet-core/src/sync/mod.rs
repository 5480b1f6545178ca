//! Synchronization between the primary and secondary stores

mod engine;
mod locks;
mod metrics;
mod report;
mod resolver;
mod retry;
mod tracker;
mod worker;

pub use engine::{PurgeReport, SyncEngine};
pub use locks::LockManager;
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use report::{PassReport, TableReport};
pub use resolver::{materialize, resolve, Resolution};
pub use retry::{retry_with_backoff, RetryOutcome, RetryPolicy};
pub use tracker::ChangeTracker;
pub use worker::{SyncWorker, WorkerCommand, WorkerHandle};
