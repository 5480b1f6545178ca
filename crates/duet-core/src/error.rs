//! Error types for duet-core

use thiserror::Error;

use crate::models::StoreId;

/// Result type alias using duet-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in duet-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Store could not be reached
    #[error("{store} store unavailable: {message}")]
    Unavailable { store: StoreId, message: String },

    /// Store call exceeded its deadline
    #[error("{store} store timed out: {message}")]
    Timeout { store: StoreId, message: String },

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Migration script checksum no longer matches the ledger
    #[error("Migration integrity error on {store} store: {message}")]
    Integrity { store: StoreId, message: String },

    /// Migrations on a store were halted by an earlier integrity error
    #[error("Migrations halted on {store} store: {reason}")]
    MigrationHalted { store: StoreId, reason: String },

    /// Rollback range contains destructive steps and was not acknowledged
    #[error("Rollback includes destructive steps {versions:?}; explicit acknowledgement required")]
    DestructiveRollback { versions: Vec<u32> },

    /// Migration step has no down-script
    #[error("Migration v{0} has no down-script and cannot be rolled back")]
    IrreversibleStep(u32),

    /// Offline operation dequeued out of sequence
    #[error("Ordering violation in {partition}: sequence {found} after {previous}")]
    OrderingViolation {
        partition: String,
        previous: i64,
        found: i64,
    },

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Background worker is no longer accepting commands
    #[error("Sync worker is not running")]
    WorkerStopped,

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking or spawned task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether retrying the same call later can succeed.
    ///
    /// Only network/timeout failures and `SQLite` lock contention qualify;
    /// integrity and ordering errors are never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } | Self::Timeout { .. } => true,
            Self::Database(rusqlite::Error::SqliteFailure(error, _)) => matches!(
                error.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    pub(crate) fn unavailable(store: StoreId, message: impl Into<String>) -> Self {
        Self::Unavailable {
            store,
            message: message.into(),
        }
    }
}
