//! Sync conflict model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;
use crate::models::{Record, StoreId, TenantId};

/// Configured conflict-resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Primary copy is authoritative
    #[default]
    PrimaryWins,
    /// Secondary copy is authoritative
    SecondaryWins,
    /// Later `updated_at` wins; exact ties go to the primary
    NewestWins,
    /// Nothing is written until an operator picks a winner
    Manual,
}

impl ConflictStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryWins => "primary_wins",
            Self::SecondaryWins => "secondary_wins",
            Self::NewestWins => "newest_wins",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary_wins" => Ok(Self::PrimaryWins),
            "secondary_wins" => Ok(Self::SecondaryWins),
            "newest_wins" => Ok(Self::NewestWins),
            "manual" => Ok(Self::Manual),
            other => Err(Error::InvalidInput(format!(
                "unknown conflict strategy: {other}"
            ))),
        }
    }
}

/// Lifecycle of a conflict row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    AutoResolved,
    PendingManual,
    ResolvedManual,
}

impl ResolutionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoResolved => "auto_resolved",
            Self::PendingManual => "pending_manual",
            Self::ResolvedManual => "resolved_manual",
        }
    }
}

impl FromStr for ResolutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_resolved" => Ok(Self::AutoResolved),
            "pending_manual" => Ok(Self::PendingManual),
            "resolved_manual" => Ok(Self::ResolvedManual),
            other => Err(Error::InvalidInput(format!(
                "unknown resolution status: {other}"
            ))),
        }
    }
}

/// Where a conflict was detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOrigin {
    /// Both stores changed the record between two passes
    SyncPass,
    /// An offline operation exhausted its replay attempts
    ReplayExhausted,
    /// The primary changed under a queued offline operation
    ReplayDiverged,
}

impl ConflictOrigin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SyncPass => "sync_pass",
            Self::ReplayExhausted => "replay_exhausted",
            Self::ReplayDiverged => "replay_diverged",
        }
    }
}

impl FromStr for ConflictOrigin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync_pass" => Ok(Self::SyncPass),
            "replay_exhausted" => Ok(Self::ReplayExhausted),
            "replay_diverged" => Ok(Self::ReplayDiverged),
            other => Err(Error::InvalidInput(format!("unknown conflict origin: {other}"))),
        }
    }
}

/// Operator decision for a pending manual conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "keep", content = "fields")]
pub enum Choice {
    KeepPrimary,
    KeepSecondary,
    /// Supply a hand-merged field set
    Replace(Map<String, Value>),
}

/// Recorded divergence between the two copies of one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict row identifier
    pub id: i64,
    pub tenant: TenantId,
    pub table: String,
    pub primary_key: String,
    /// Primary copy's version when detected (absent if the primary had none)
    pub primary_version: Option<u64>,
    /// Secondary copy's version when detected
    pub secondary_version: Option<u64>,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
    pub strategy_applied: ConflictStrategy,
    pub origin: ConflictOrigin,
    pub resolution_status: ResolutionStatus,
    /// Side whose content won, for auto and keep-side resolutions
    pub winner: Option<StoreId>,
    pub primary_record: Option<Record>,
    pub secondary_record: Option<Record>,
    /// Content chosen by the operator, waiting to be written by the next pass
    pub resolved_record: Option<Record>,
    pub resolved_at: Option<i64>,
    /// When the winning content reached both stores
    pub applied_at: Option<i64>,
}

impl Conflict {
    pub const fn is_pending(&self) -> bool {
        matches!(self.resolution_status, ResolutionStatus::PendingManual)
    }

    /// Resolved by an operator but not yet written to both stores
    pub const fn awaiting_apply(&self) -> bool {
        matches!(self.resolution_status, ResolutionStatus::ResolvedManual)
            && self.applied_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_round_trips_through_strings() {
        for strategy in [
            ConflictStrategy::PrimaryWins,
            ConflictStrategy::SecondaryWins,
            ConflictStrategy::NewestWins,
            ConflictStrategy::Manual,
        ] {
            assert_eq!(strategy.as_str().parse::<ConflictStrategy>().unwrap(), strategy);
        }
        assert!("lww".parse::<ConflictStrategy>().is_err());
    }

    #[test]
    fn origins_parse_from_storage_strings() {
        for origin in [
            ConflictOrigin::SyncPass,
            ConflictOrigin::ReplayExhausted,
            ConflictOrigin::ReplayDiverged,
        ] {
            assert_eq!(origin.as_str().parse::<ConflictOrigin>().unwrap(), origin);
        }
    }

    #[test]
    fn choice_serializes_with_tag() {
        let json = serde_json::to_string(&Choice::KeepPrimary).unwrap();
        assert_eq!(json, r#"{"keep":"keep_primary"}"#);
    }
}
