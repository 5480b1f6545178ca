//! Schema migrations tracked independently per store

mod catalog;
mod ledger;

pub use catalog::MigrationCatalog;
pub use ledger::{LedgerStatus, MigrationLedger, PlannedRollback, RollbackPlan, StepStatus};
