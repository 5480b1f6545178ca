//! Data models for Duet

mod conflict;
mod cursor;
mod migration;
mod operation;
mod record;

pub use conflict::{Choice, Conflict, ConflictOrigin, ConflictStrategy, ResolutionStatus};
pub use cursor::{Cursor, StoreId};
pub use migration::{MigrationApplication, MigrationStep};
pub use operation::{OfflineOperation, OperationKind, OperationStatus};
pub use record::{compute_checksum, validate_table_name, Record, RecordKey, TenantId};
