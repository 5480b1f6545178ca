//! Control database layer

mod baselines;
mod conflicts;
mod connection;
mod cursors;
mod failed_batches;
mod ledger;
mod migrations;
mod operations;
mod service;

pub use baselines::SqliteBaselineRepository;
pub use conflicts::SqliteConflictRepository;
pub use connection::Database;
pub use cursors::{CursorRepository, SqliteCursorRepository};
pub use failed_batches::{FailedBatch, SqliteFailedBatchRepository};
pub use ledger::SqliteLedgerRepository;
pub use operations::{OperationCount, SqliteOperationRepository};
pub use service::{CommittedBatch, ControlDb};

use std::str::FromStr;

use rusqlite::types::Type;
use serde::de::DeserializeOwned;

/// Parse a text column into one of the model enums
pub(crate) fn parse_column<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, error.to_string().into())
    })
}

/// Decode an optional JSON text column
pub(crate) fn json_column<T: DeserializeOwned>(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<T>> {
    raw.map(|text| {
        serde_json::from_str(&text)
            .map_err(|error| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(error)))
    })
    .transpose()
}
