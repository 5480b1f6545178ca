//! Shared connectivity state types.

use serde::{Deserialize, Serialize};

/// Reachability of the primary store as last observed by the monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl Connectivity {
    /// Writes may target the primary directly.
    ///
    /// `Unknown` is treated as online until the first probe says otherwise.
    pub const fn primary_writable(self) -> bool {
        !matches!(self, Self::Offline)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}
