//! Offline operation model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::{Record, RecordKey, TenantId};

/// Kind of write captured while the primary was unreachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub const ALL: [Self; 3] = [Self::Insert, Self::Update, Self::Delete];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation kind: {other}"))),
        }
    }
}

/// Replay status of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Applied,
    Failed,
}

impl OperationStatus {
    pub const ALL: [Self; 3] = [Self::Pending, Self::Applied, Self::Failed];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown operation status: {other}"
            ))),
        }
    }
}

/// A write made against the secondary while offline, waiting for replay.
///
/// `sequence_no` is monotonic per (tenant, table) and is the only ordering
/// key used during replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: i64,
    pub tenant: TenantId,
    pub table: String,
    pub primary_key: String,
    pub op: OperationKind,
    /// Record as written to the secondary, including its version
    pub payload: Record,
    /// Checksum of the secondary's copy the write replaced, `None` for a new key
    pub base_checksum: Option<String>,
    pub sequence_no: i64,
    pub created_at: i64,
    pub attempt_count: u32,
    pub status: OperationStatus,
    pub last_error: Option<String>,
}

impl OfflineOperation {
    pub fn key(&self) -> &RecordKey {
        &self.payload.key
    }

    /// Drain partition label, `tenant/table`
    pub fn partition(&self) -> String {
        format!("{}/{}", self.tenant, self.table)
    }
}
