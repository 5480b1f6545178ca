use std::path::PathBuf;

use clap::Parser;
use duet_core::config::SyncSettings;
use duet_core::models::Choice;
use duet_core::sync::RetryPolicy;
use duet_core::{RecordKey, StoreId};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::cli::{Cli, Commands, ConflictCommands, KeepSide, MigrateCommands, PathArgs};
use crate::commands::common::{
    format_ledger_lines, open_surface_with, parse_tenant, resolve_paths_with, ResolvedPaths,
};
use crate::commands::conflicts::parse_choice;
use crate::commands::queue::run_queue_clear;
use crate::commands::status::format_status_lines;
use crate::error::CliError;

fn temp_paths(dir: &tempfile::TempDir) -> ResolvedPaths {
    ResolvedPaths {
        primary: dir.path().join("primary.db"),
        secondary: dir.path().join("secondary.db"),
        control: dir.path().join("state").join("control.db"),
        migrations: None,
    }
}

fn settings() -> SyncSettings {
    SyncSettings {
        retry: RetryPolicy::immediate(1),
        tables: vec!["patients".to_string()],
        ..SyncSettings::default()
    }
}

#[test]
fn flags_take_precedence_over_env_and_data_dir() {
    let args = PathArgs {
        primary_db: Some(PathBuf::from("/flag/primary.db")),
        ..PathArgs::default()
    };
    let paths = resolve_paths_with(
        &args,
        |name| (name == "DUET_SECONDARY_DB_PATH").then(|| PathBuf::from("/env/secondary.db")),
        PathBuf::from("/data/duet"),
    );
    assert_eq!(
        paths,
        ResolvedPaths {
            primary: PathBuf::from("/flag/primary.db"),
            secondary: PathBuf::from("/env/secondary.db"),
            control: PathBuf::from("/data/duet/control.db"),
            migrations: None,
        }
    );
}

#[test]
fn parse_choice_accepts_side_or_object() {
    assert!(matches!(
        parse_choice(Some(KeepSide::Secondary), None).unwrap(),
        Choice::KeepSecondary
    ));
    match parse_choice(None, Some(r#"{"name": "Ana"}"#)).unwrap() {
        Choice::Replace(fields) => assert_eq!(fields["name"], json!("Ana")),
        _ => panic!("expected replacement fields"),
    }
    assert!(matches!(
        parse_choice(None, Some("[1, 2]")),
        Err(CliError::FieldsNotAnObject)
    ));
    assert!(matches!(parse_choice(None, None), Err(CliError::NoChoice)));
}

#[test]
fn resolve_requires_exactly_one_choice() {
    assert!(Cli::try_parse_from(["duet", "conflicts", "resolve", "--tenant", "t", "4"]).is_err());
    assert!(Cli::try_parse_from([
        "duet", "conflicts", "resolve", "--tenant", "t", "4", "--keep", "primary", "--fields", "{}",
    ])
    .is_err());

    let cli = Cli::try_parse_from([
        "duet", "conflicts", "resolve", "--tenant", "t", "4", "--keep", "primary",
    ])
    .unwrap();
    match cli.command {
        Commands::Conflicts {
            command: ConflictCommands::Resolve { id, keep, .. },
        } => {
            assert_eq!(id, 4);
            assert_eq!(keep, Some(KeepSide::Primary));
        }
        _ => panic!("expected conflicts resolve"),
    }
}

#[test]
fn global_path_flags_parse_after_subcommand() {
    let cli = Cli::try_parse_from([
        "duet",
        "migrate",
        "rollback",
        "secondary",
        "3",
        "--accept-destructive",
        "--control-db",
        "/tmp/control.db",
    ])
    .unwrap();
    assert_eq!(cli.paths.control_db, Some(PathBuf::from("/tmp/control.db")));
    match cli.command {
        Commands::Migrate {
            command:
                MigrateCommands::Rollback {
                    store,
                    target,
                    accept_destructive,
                },
        } => {
            assert_eq!(StoreId::from(store), StoreId::Secondary);
            assert_eq!(target, 3);
            assert!(accept_destructive);
        }
        _ => panic!("expected migrate rollback"),
    }
}

#[test]
fn blank_tenant_is_rejected() {
    assert!(parse_tenant("  ").is_err());
    assert_eq!(parse_tenant(" clinic ").unwrap().as_str(), "clinic");
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_clear_needs_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let result = run_queue_clear("clinic", None, false, &temp_paths(&dir)).await;
    assert!(matches!(result, Err(CliError::ClearNotConfirmed)));
}

#[tokio::test(flavor = "multi_thread")]
async fn opened_surface_syncs_between_sqlite_files() {
    let dir = tempfile::tempdir().unwrap();
    let paths = temp_paths(&dir);
    let surface = open_surface_with(&paths, settings()).unwrap();
    let tenant = parse_tenant("clinic").unwrap();
    let key = RecordKey::new(tenant.clone(), "patients", "p1").unwrap();

    let mut fields = serde_json::Map::new();
    fields.insert("name".into(), json!("Ana"));
    surface.insert(&key, fields).await.unwrap();
    let report = surface.trigger_sync(&tenant).await.unwrap();
    assert_eq!(report.table("patients").unwrap().written_secondary, 1);

    let status = surface.status(&tenant).await.unwrap();
    let lines = format_status_lines(&status);
    assert!(lines.iter().any(|line| line.starts_with("Tenant:") && line.ends_with("clinic")));
    assert!(lines.iter().any(|line| line.contains("patients")));

    // Reopening the same files sees the persisted cursors.
    drop(surface);
    let reopened = open_surface_with(&paths, settings()).unwrap();
    let again = reopened.trigger_sync(&tenant).await.unwrap();
    assert_eq!(again.total_written(), 0);
    assert!(paths.control.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn ledger_lines_flag_pending_steps() {
    let dir = tempfile::tempdir().unwrap();
    let migrations = dir.path().join("migrations");
    std::fs::create_dir_all(&migrations).unwrap();
    std::fs::write(
        migrations.join("0001.json"),
        json!({"version": 1, "name": "init", "up": "CREATE visits"}).to_string(),
    )
    .unwrap();
    let paths = ResolvedPaths {
        migrations: Some(migrations),
        ..temp_paths(&dir)
    };
    let surface = open_surface_with(&paths, settings()).unwrap();

    let statuses = surface.migration_status().await.unwrap();
    let lines = format_ledger_lines(&statuses[0]);
    assert_eq!(lines[0], "primary store at v0");
    assert!(lines[1].contains("pending"));
    assert!(lines[1].contains("irreversible"));
}
