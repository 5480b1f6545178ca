//! Record model shared by both stores

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Tenant identifier; every record, cursor, conflict and queued operation is
/// scoped to exactly one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id, rejecting blank values
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("tenant id cannot be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Validate a synced table name.
///
/// Valid names match `^[a-z][a-z0-9_]{0,62}$`.
pub fn validate_table_name(table: &str) -> Result<()> {
    static TABLE_NAME: OnceLock<Regex> = OnceLock::new();
    let re = TABLE_NAME.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]{0,62}$").expect("Invalid regex"));
    if re.is_match(table) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid table name: {table:?}")))
    }
}

/// Identity of a record: (tenant, table, primary key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub tenant: TenantId,
    pub table: String,
    pub primary_key: String,
}

impl RecordKey {
    pub fn new(
        tenant: TenantId,
        table: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        let primary_key = primary_key.into();
        if primary_key.is_empty() {
            return Err(Error::InvalidInput("primary key cannot be empty".into()));
        }
        Ok(Self {
            tenant,
            table,
            primary_key,
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.table, self.primary_key)
    }
}

/// An opaque versioned row.
///
/// `version` is a per-store logical clock and the only ordering signal;
/// `updated_at` (unix ms) is used solely as a tie-break by `newest_wins`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub fields: Map<String, Value>,
    pub version: u64,
    pub checksum: String,
    pub updated_at: i64,
    pub tombstoned_at: Option<i64>,
}

impl Record {
    /// Build a live record, computing its checksum
    pub fn new(key: RecordKey, fields: Map<String, Value>, version: u64, updated_at: i64) -> Self {
        let checksum = compute_checksum(&fields, false);
        Self {
            key,
            fields,
            version,
            checksum,
            updated_at,
            tombstoned_at: None,
        }
    }

    /// Copy of this record soft-deleted at `at`, carrying `version`
    #[must_use]
    pub fn tombstoned(&self, version: u64, at: i64) -> Self {
        Self {
            key: self.key.clone(),
            fields: self.fields.clone(),
            version,
            checksum: compute_checksum(&self.fields, true),
            updated_at: at,
            tombstoned_at: Some(at),
        }
    }

    /// Copy of this record re-stamped with a new version
    #[must_use]
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    pub const fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }

    /// Same content on both sides, regardless of version or timestamps
    pub fn converged_with(&self, other: &Self) -> bool {
        self.checksum == other.checksum
    }

    /// Re-applying this record onto `existing` would change nothing
    pub fn is_same_revision(&self, existing: &Self) -> bool {
        self.version == existing.version
            && self.checksum == existing.checksum
            && self.tombstoned_at.is_some() == existing.tombstoned_at.is_some()
    }

    /// Recompute the checksum from the current field values
    pub fn expected_checksum(&self) -> String {
        compute_checksum(&self.fields, self.is_tombstoned())
    }
}

/// Deterministic SHA-256 (hex) over a record's field values.
///
/// Object keys are sorted recursively before hashing so the digest never
/// depends on insertion order. The tombstone marker is appended so a
/// soft-deleted record diverges from its live twin.
pub fn compute_checksum(fields: &Map<String, Value>, tombstoned: bool) -> String {
    let canonical = canonicalize(&Value::Object(fields.clone()));
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let marker: &[u8] = if tombstoned { b"|deleted" } else { b"|live" };
    hasher.update(marker);
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect();
            let body = sorted
                .into_iter()
                .map(|(key, value)| format!("{}:{value}", Value::String(key.clone())))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonicalize).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        scalar => scalar.to_string(),
    }
}
