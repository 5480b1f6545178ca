//! Schema migration models

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::StoreId;

/// One versioned schema change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    pub version: u32,
    pub name: String,
    pub up_script: String,
    pub down_script: Option<String>,
    /// Rolling back this step loses data
    #[serde(default)]
    pub destructive: bool,
    pub checksum: String,
}

impl MigrationStep {
    pub fn new(
        version: u32,
        name: impl Into<String>,
        up_script: impl Into<String>,
        down_script: Option<String>,
    ) -> Self {
        let name = name.into();
        let up_script = up_script.into();
        let checksum = script_checksum(version, &name, &up_script, down_script.as_deref());
        Self {
            version,
            name,
            up_script,
            down_script,
            destructive: false,
            checksum,
        }
    }

    /// Mark the step as losing data when rolled back
    #[must_use]
    pub const fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    pub const fn is_reversible(&self) -> bool {
        self.down_script.is_some()
    }
}

/// SHA-256 (hex) over `version|name|up|down`
pub fn script_checksum(version: u32, name: &str, up: &str, down: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(up.as_bytes());
    hasher.update(b"|");
    hasher.update(down.unwrap_or_default().as_bytes());
    hex::encode(hasher.finalize())
}

/// Ledger row: a step applied to one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationApplication {
    pub version: u32,
    pub store: StoreId,
    pub applied_at: i64,
    /// Step checksum at the moment it was applied
    pub checksum: String,
}
