//! Offline mode: connectivity tracking, write redirection and queue replay

mod monitor;
mod queue;
mod router;

pub use monitor::ConnectivityMonitor;
pub use queue::{DrainReport, OfflineQueue, PartitionReport};
pub use router::{RoutedWrite, WriteRouter};
