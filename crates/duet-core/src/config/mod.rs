//! Environment-driven engine configuration

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::{validate_table_name, ConflictStrategy, TenantId};
use crate::sync::RetryPolicy;

pub const DEFAULT_SYNC_TABLES: &[&str] = &[
    "users",
    "patients",
    "appointments",
    "medical_records",
    "prescriptions",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::Error {
    fn from(error: ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

/// Runtime settings for the sync engine, offline queue and background tasks
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Run periodic passes
    pub sync_enabled: bool,
    pub sync_interval: Duration,
    pub strategy: ConflictStrategy,
    /// Per-tenant overrides of `strategy`
    pub tenant_strategies: BTreeMap<TenantId, ConflictStrategy>,
    /// Maximum records pulled per side per batch
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Redirect writes to the secondary while the primary is unreachable
    pub offline_mode_enabled: bool,
    /// Tombstones and applied queue entries older than this are purged
    pub retention: Duration,
    pub probe_interval: Duration,
    pub drain_interval: Duration,
    /// Tables synced for every tenant
    pub tables: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_enabled: true,
            sync_interval: Duration::from_secs(300),
            strategy: ConflictStrategy::PrimaryWins,
            tenant_strategies: BTreeMap::new(),
            batch_size: 1_000,
            retry: RetryPolicy::default(),
            offline_mode_enabled: true,
            retention: Duration::from_secs(30 * 86_400),
            probe_interval: Duration::from_secs(30),
            drain_interval: Duration::from_secs(60),
            tables: DEFAULT_SYNC_TABLES.iter().map(ToString::to_string).collect(),
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let sync_enabled = parse_bool(&lookup, "DUET_SYNC_ENABLED", true)?;
        let sync_interval_secs =
            parse_in_range(&lookup, "DUET_SYNC_INTERVAL_SECS", 300_u64, 5..=86_400)?;

        let strategy = optional_trimmed(&lookup, "DUET_CONFLICT_STRATEGY")
            .map(|value| value.parse::<ConflictStrategy>())
            .transpose()
            .map_err(|_| {
                ConfigError::Invalid(
                    "DUET_CONFLICT_STRATEGY must be one of primary_wins, secondary_wins, newest_wins, manual"
                        .to_string(),
                )
            })?
            .unwrap_or_default();

        let tenant_strategies = optional_trimmed(&lookup, "DUET_TENANT_STRATEGIES")
            .map(|raw| parse_tenant_strategies(&raw))
            .transpose()?
            .unwrap_or_default();

        let batch_size = parse_in_range(&lookup, "DUET_BATCH_SIZE", 1_000_usize, 1..=100_000)?;

        let max_attempts = parse_in_range(&lookup, "DUET_RETRY_MAX_ATTEMPTS", 3_u32, 1..=20)?;
        let base_delay_ms =
            parse_in_range(&lookup, "DUET_RETRY_BASE_DELAY_MS", 5_000_u64, 0..=600_000)?;
        let multiplier = parse_in_range(&lookup, "DUET_RETRY_MULTIPLIER", 2.0_f64, 1.0..=10.0)?;
        let max_delay_ms =
            parse_in_range(&lookup, "DUET_RETRY_MAX_DELAY_MS", 60_000_u64, 0..=3_600_000)?;
        if max_delay_ms < base_delay_ms {
            return Err(ConfigError::Invalid(
                "DUET_RETRY_MAX_DELAY_MS must be >= DUET_RETRY_BASE_DELAY_MS".to_string(),
            ));
        }

        let offline_mode_enabled = parse_bool(&lookup, "DUET_OFFLINE_MODE_ENABLED", true)?;
        let retention_days =
            parse_in_range(&lookup, "DUET_OFFLINE_RETENTION_DAYS", 30_u64, 1..=3_650)?;
        let probe_interval_secs =
            parse_in_range(&lookup, "DUET_PROBE_INTERVAL_SECS", 30_u64, 1..=3_600)?;
        let drain_interval_secs =
            parse_in_range(&lookup, "DUET_DRAIN_INTERVAL_SECS", 60_u64, 1..=86_400)?;

        let tables = match optional_trimmed(&lookup, "DUET_SYNC_TABLES") {
            Some(raw) => parse_tables(&raw)?,
            None => Self::default().tables,
        };

        Ok(Self {
            sync_enabled,
            sync_interval: Duration::from_secs(sync_interval_secs),
            strategy,
            tenant_strategies,
            batch_size,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(base_delay_ms),
                multiplier,
                max_delay: Duration::from_millis(max_delay_ms),
            },
            offline_mode_enabled,
            retention: Duration::from_secs(retention_days * 86_400),
            probe_interval: Duration::from_secs(probe_interval_secs),
            drain_interval: Duration::from_secs(drain_interval_secs),
            tables,
        })
    }
}

impl SyncSettings {
    /// Strategy configured for a tenant, falling back to the global one
    pub fn strategy_for(&self, tenant: &TenantId) -> ConflictStrategy {
        self.tenant_strategies
            .get(tenant)
            .copied()
            .unwrap_or(self.strategy)
    }
}

/// Parse `tenant=strategy` pairs separated by commas
fn parse_tenant_strategies(raw: &str) -> Result<BTreeMap<TenantId, ConflictStrategy>, ConfigError> {
    let invalid = |pair: &str| {
        ConfigError::Invalid(format!(
            "DUET_TENANT_STRATEGIES entry {pair:?} must look like tenant=strategy"
        ))
    };
    let mut strategies = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let (tenant, strategy) = pair.split_once('=').ok_or_else(|| invalid(pair))?;
        let tenant = TenantId::new(tenant).map_err(|_| invalid(pair))?;
        let strategy = strategy.parse::<ConflictStrategy>().map_err(|_| invalid(pair))?;
        strategies.insert(tenant, strategy);
    }
    Ok(strategies)
}

fn parse_tables(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut tables: Vec<String> = Vec::new();
    for table in raw.split(',').map(str::trim).filter(|table| !table.is_empty()) {
        validate_table_name(table)
            .map_err(|_| ConfigError::Invalid(format!("DUET_SYNC_TABLES has invalid table {table:?}")))?;
        if !tables.iter().any(|existing| existing == table) {
            tables.push(table.to_string());
        }
    }
    if tables.is_empty() {
        return Err(ConfigError::Invalid(
            "DUET_SYNC_TABLES must name at least one table".to_string(),
        ));
    }
    Ok(tables)
}

fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be a number in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = match optional_trimmed(lookup, name) {
        Some(raw) => raw.parse::<T>().map_err(|_| invalid())?,
        None => default,
    };
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

fn parse_bool(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(format!("{name} must be true or false"))),
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    crate::util::normalize_text_option(lookup(name))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Result<SyncSettings, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        SyncSettings::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(settings(&[]).unwrap(), SyncSettings::default());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let parsed = settings(&[("DUET_BATCH_SIZE", "   "), ("DUET_CONFLICT_STRATEGY", "")]).unwrap();
        assert_eq!(parsed.batch_size, 1_000);
        assert_eq!(parsed.strategy, ConflictStrategy::PrimaryWins);
    }

    #[test]
    fn recognized_values_are_parsed() {
        let parsed = settings(&[
            ("DUET_SYNC_ENABLED", "false"),
            ("DUET_SYNC_INTERVAL_SECS", "60"),
            ("DUET_CONFLICT_STRATEGY", " newest_wins "),
            ("DUET_BATCH_SIZE", "50"),
            ("DUET_RETRY_MAX_ATTEMPTS", "5"),
            ("DUET_RETRY_BASE_DELAY_MS", "10"),
            ("DUET_RETRY_MULTIPLIER", "3"),
            ("DUET_RETRY_MAX_DELAY_MS", "100"),
            ("DUET_OFFLINE_MODE_ENABLED", "off"),
            ("DUET_OFFLINE_RETENTION_DAYS", "7"),
            ("DUET_SYNC_TABLES", "patients, appointments,patients"),
        ])
        .unwrap();

        assert!(!parsed.sync_enabled);
        assert_eq!(parsed.sync_interval, Duration::from_secs(60));
        assert_eq!(parsed.strategy, ConflictStrategy::NewestWins);
        assert_eq!(parsed.batch_size, 50);
        assert_eq!(
            parsed.retry,
            RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(10),
                multiplier: 3.0,
                max_delay: Duration::from_millis(100),
            }
        );
        assert!(!parsed.offline_mode_enabled);
        assert_eq!(parsed.retention, Duration::from_secs(7 * 86_400));
        assert_eq!(parsed.tables, vec!["patients".to_string(), "appointments".to_string()]);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        for (name, value) in [
            ("DUET_SYNC_INTERVAL_SECS", "1"),
            ("DUET_BATCH_SIZE", "0"),
            ("DUET_BATCH_SIZE", "many"),
            ("DUET_RETRY_MAX_ATTEMPTS", "21"),
            ("DUET_RETRY_MULTIPLIER", "0.5"),
            ("DUET_SYNC_ENABLED", "maybe"),
        ] {
            let err = settings(&[(name, value)]).unwrap_err();
            assert!(err.to_string().contains(name), "{name}={value}: {err}");
        }
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let err = settings(&[("DUET_CONFLICT_STRATEGY", "lww")]).unwrap_err();
        assert!(err.to_string().contains("DUET_CONFLICT_STRATEGY"));
    }

    #[test]
    fn retry_ceiling_must_cover_base_delay() {
        let err = settings(&[
            ("DUET_RETRY_BASE_DELAY_MS", "500"),
            ("DUET_RETRY_MAX_DELAY_MS", "100"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("DUET_RETRY_MAX_DELAY_MS"));
    }

    #[test]
    fn tenant_overrides_take_precedence() {
        let parsed = settings(&[
            ("DUET_CONFLICT_STRATEGY", "secondary_wins"),
            ("DUET_TENANT_STRATEGIES", "clinic-a=manual, clinic-b = newest_wins"),
        ])
        .unwrap();
        let tenant = |name: &str| TenantId::new(name).unwrap();
        assert_eq!(parsed.strategy_for(&tenant("clinic-a")), ConflictStrategy::Manual);
        assert_eq!(parsed.strategy_for(&tenant("clinic-b")), ConflictStrategy::NewestWins);
        assert_eq!(parsed.strategy_for(&tenant("clinic-c")), ConflictStrategy::SecondaryWins);

        assert!(settings(&[("DUET_TENANT_STRATEGIES", "clinic-a")]).is_err());
        assert!(settings(&[("DUET_TENANT_STRATEGIES", "clinic-a=lww")]).is_err());
    }

    #[test]
    fn invalid_table_names_are_rejected() {
        assert!(settings(&[("DUET_SYNC_TABLES", "patients,Bad-Name")]).is_err());
        assert!(settings(&[("DUET_SYNC_TABLES", " , ")]).is_err());
    }
}
