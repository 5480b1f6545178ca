//! Store identity and sync cursors

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::models::TenantId;

/// One of the two physical stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreId {
    /// High-availability store (store A)
    Primary,
    /// Disconnected-capable local store (store B)
    Secondary,
}

impl StoreId {
    pub const ALL: [Self; 2] = [Self::Primary, Self::Secondary];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    /// The store on the other side of the pair
    pub const fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for StoreId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "a" => Ok(Self::Primary),
            "secondary" | "b" | "local" => Ok(Self::Secondary),
            other => Err(Error::InvalidInput(format!("unknown store: {other}"))),
        }
    }
}

/// Last-acknowledged version watermark for one (tenant, table, store)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub tenant: TenantId,
    pub table: String,
    pub store: StoreId,
    pub version: u64,
    /// Unix ms of the commit that last moved this cursor
    pub updated_at: i64,
}
