use std::env;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use duet_core::config::SyncSettings;
use duet_core::control::ControlSurface;
use duet_core::db::ControlDb;
use duet_core::migrate::{LedgerStatus, MigrationCatalog};
use duet_core::models::{Conflict, OfflineOperation};
use duet_core::store::{SqliteStore, StoreAdapter};
use duet_core::sync::{PassReport, SyncEngine};
use duet_core::util::format_timestamp;
use duet_core::{StoreId, TenantId};

use crate::cli::PathArgs;
use crate::error::CliError;

/// Fully resolved database locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub primary: PathBuf,
    pub secondary: PathBuf,
    pub control: PathBuf,
    pub migrations: Option<PathBuf>,
}

pub fn resolve_paths(args: &PathArgs) -> ResolvedPaths {
    resolve_paths_with(args, |name| env::var_os(name).map(PathBuf::from), default_data_dir())
}

/// Flag first, then env var, then a file under `data_dir`
pub fn resolve_paths_with(
    args: &PathArgs,
    lookup: impl Fn(&str) -> Option<PathBuf>,
    data_dir: PathBuf,
) -> ResolvedPaths {
    let pick = |flag: &Option<PathBuf>, var: &str, file: &str| {
        flag.clone()
            .or_else(|| lookup(var))
            .unwrap_or_else(|| data_dir.join(file))
    };
    ResolvedPaths {
        primary: pick(&args.primary_db, "DUET_PRIMARY_DB_PATH", "primary.db"),
        secondary: pick(&args.secondary_db, "DUET_SECONDARY_DB_PATH", "secondary.db"),
        control: pick(&args.control_db, "DUET_CONTROL_DB_PATH", "control.db"),
        migrations: args
            .migrations_dir
            .clone()
            .or_else(|| lookup("DUET_MIGRATIONS_DIR")),
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("duet")
}

pub fn open_surface(paths: &ResolvedPaths) -> Result<ControlSurface, CliError> {
    open_surface_with(paths, SyncSettings::from_env()?)
}

pub fn open_surface_with(
    paths: &ResolvedPaths,
    settings: SyncSettings,
) -> Result<ControlSurface, CliError> {
    let primary = SqliteStore::open(StoreId::Primary, &paths.primary)?;
    let secondary = SqliteStore::open(StoreId::Secondary, &paths.secondary)?;
    if let Some(parent) = paths.control.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let control = ControlDb::open_path(&paths.control)?;
    let catalog = load_catalog(paths.migrations.as_deref())?;
    tracing::debug!(
        primary = %paths.primary.display(),
        secondary = %paths.secondary.display(),
        control = %paths.control.display(),
        migrations = catalog.latest_version(),
        "Opened stores"
    );

    let engine = SyncEngine::new(
        Arc::new(primary) as Arc<dyn StoreAdapter>,
        Arc::new(secondary) as Arc<dyn StoreAdapter>,
        control,
        settings,
    );
    Ok(ControlSurface::new(Arc::new(engine), catalog))
}

fn load_catalog(dir: Option<&Path>) -> Result<MigrationCatalog, CliError> {
    match dir {
        Some(dir) => Ok(MigrationCatalog::load_dir(dir)?),
        None => Ok(MigrationCatalog::default()),
    }
}

pub fn parse_tenant(tenant: &str) -> Result<TenantId, CliError> {
    Ok(TenantId::new(tenant.trim())?)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn format_pass_lines(report: &PassReport) -> Vec<String> {
    let mut lines = vec![format!(
        "Pass {} for {}: {} written, {} conflicts",
        report.pass_id,
        report.tenant,
        report.total_written(),
        report.total_conflicts()
    )];
    for table in &report.tables {
        let mut line = format!(
            "  {:<16} pulled {}/{}  wrote {}/{}  auto {}  manual {}  frozen {}",
            table.table,
            table.pulled_primary,
            table.pulled_secondary,
            table.written_primary,
            table.written_secondary,
            table.conflicts_auto,
            table.conflicts_manual,
            table.skipped_frozen,
        );
        if let Some(error) = &table.failed {
            let _ = write!(line, "  FAILED: {error}");
        }
        lines.push(line);
    }
    lines
}

pub fn format_conflict_lines(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let winner = conflict
                .winner
                .map_or_else(|| "-".to_string(), |store| store.to_string());
            format!(
                "#{:<5} {}/{}  {}  strategy={} winner={} origin={}  {}",
                conflict.id,
                conflict.table,
                conflict.primary_key,
                conflict.resolution_status.as_str(),
                conflict.strategy_applied,
                winner,
                conflict.origin.as_str(),
                format_timestamp(conflict.detected_at),
            )
        })
        .collect()
}

pub fn format_operation_lines(operations: &[OfflineOperation]) -> Vec<String> {
    operations
        .iter()
        .map(|operation| {
            let mut line = format!(
                "{:>6}  {:<6} {}/{}  {}  attempts={}  {}",
                operation.sequence_no,
                operation.op,
                operation.table,
                operation.primary_key,
                operation.status,
                operation.attempt_count,
                format_timestamp(operation.created_at),
            );
            if let Some(error) = &operation.last_error {
                let _ = write!(line, "  ({error})");
            }
            line
        })
        .collect()
}

pub fn format_ledger_lines(status: &LedgerStatus) -> Vec<String> {
    let mut lines = vec![format!(
        "{} store at v{}{}",
        status.store,
        status.current_version,
        status
            .halted
            .as_ref()
            .map_or_else(String::new, |reason| format!("  HALTED: {reason}"))
    )];
    for step in &status.steps {
        let state = match (step.applied_at, step.checksum_matches) {
            (Some(_), Some(false)) => "CHANGED".to_string(),
            (Some(at), _) => format!("applied {}", format_timestamp(at)),
            (None, _) => "pending".to_string(),
        };
        let mut flags = Vec::new();
        if step.destructive {
            flags.push("destructive");
        }
        if !step.reversible {
            flags.push("irreversible");
        }
        lines.push(format!(
            "  v{:<4} {:<32} {state}{}",
            step.version,
            step.name,
            if flags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", flags.join(", "))
            }
        ));
    }
    lines
}
