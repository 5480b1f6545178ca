//! Schema migrations applied to each store on its own schedule.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{settings, Harness};
use duet_core::control::ControlSurface;
use duet_core::migrate::MigrationCatalog;
use duet_core::{Error, StoreId};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn write_step(dir: &Path, version: u32, up: &str, down: Option<&str>, destructive: bool) {
    let step = json!({
        "version": version,
        "name": format!("step {version}"),
        "up": up,
        "down": down,
        "destructive": destructive,
    });
    fs::write(dir.join(format!("{version:04}.json")), step.to_string()).unwrap();
}

/// Catalog directory holding v1..=v7; v7 is destructive to roll back
fn catalog_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for version in 1..=6 {
        write_step(
            dir.path(),
            version,
            &format!("ALTER visits ADD c{version}"),
            Some(&format!("ALTER visits DROP c{version}")),
            false,
        );
    }
    write_step(dir.path(), 7, "ALTER visits ADD notes", Some("ALTER visits DROP notes"), true);
    dir
}

fn surface(harness: &Harness, dir: &Path) -> ControlSurface {
    ControlSurface::new(
        Arc::clone(&harness.engine),
        MigrationCatalog::load_dir(dir).unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_store_catches_up_later() {
    let harness = Harness::with_settings(settings());
    let dir = catalog_dir();
    let control = surface(&harness, dir.path());

    for store in StoreId::ALL {
        control.migrate_up(store, Some(6)).await.unwrap();
    }

    harness.secondary.set_reachable(false);
    let on_primary = control.migrate_up(StoreId::Primary, None).await.unwrap();
    assert_eq!(on_primary.len(), 1);
    assert_eq!(on_primary[0].version, 7);
    let failed = control.migrate_up(StoreId::Secondary, None).await;
    assert!(matches!(failed, Err(Error::Unavailable { .. })));

    let statuses = control.migration_status().await.unwrap();
    assert_eq!(statuses[0].current_version, 7);
    assert_eq!(statuses[1].current_version, 6);
    let pending: Vec<u32> = statuses[1].pending().map(|step| step.version).collect();
    assert_eq!(pending, vec![7]);

    tokio::time::sleep(Duration::from_millis(5)).await;
    harness.secondary.set_reachable(true);
    let on_secondary = control.migrate_up(StoreId::Secondary, None).await.unwrap();
    assert_eq!(on_secondary[0].version, 7);
    assert!(on_primary[0].applied_at < on_secondary[0].applied_at);

    // Each store ran every script exactly once, lowest version first.
    let scripts = harness.secondary.applied_scripts().await;
    assert_eq!(scripts.len(), 7);
    assert_eq!(scripts[0], "ALTER visits ADD c1");
    assert_eq!(scripts[6], "ALTER visits ADD notes");
    assert!(control.migrate_up(StoreId::Primary, None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn edited_step_file_halts_only_the_affected_stores() {
    let harness = Harness::with_settings(settings());
    let dir = catalog_dir();
    let control = surface(&harness, dir.path());
    control.migrate_up(StoreId::Primary, Some(3)).await.unwrap();

    // Someone rewrites v2 after it ran on the primary.
    write_step(dir.path(), 2, "ALTER visits ADD c2_renamed", Some("ALTER visits DROP c2"), false);
    let edited = surface(&harness, dir.path());

    let halted = edited.migrate_up(StoreId::Primary, None).await;
    assert!(matches!(halted, Err(Error::Integrity { store: StoreId::Primary, .. })));
    let again = edited.migrate_up(StoreId::Primary, None).await;
    assert!(matches!(again, Err(Error::MigrationHalted { .. })));

    // The secondary never ran the old script and is unaffected.
    assert_eq!(edited.migrate_up(StoreId::Secondary, None).await.unwrap().len(), 7);

    let statuses = edited.migration_status().await.unwrap();
    assert!(statuses[0].halted.is_some());
    assert_eq!(statuses[0].steps[1].checksum_matches, Some(false));
    assert!(edited.clear_migration_halt(StoreId::Primary).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn destructive_rollback_is_planned_then_acknowledged() {
    let harness = Harness::with_settings(settings());
    let dir = catalog_dir();
    let control = surface(&harness, dir.path());
    control.migrate_up(StoreId::Secondary, None).await.unwrap();

    let plan = control.rollback_plan(StoreId::Secondary, 5).await.unwrap();
    let versions: Vec<u32> = plan.steps.iter().map(|step| step.version).collect();
    assert_eq!(versions, vec![7, 6]);
    assert_eq!(plan.destructive_versions(), vec![7]);

    let refused = control.rollback(StoreId::Secondary, 5, false).await;
    assert!(matches!(refused, Err(Error::DestructiveRollback { .. })));
    assert_eq!(control.migration_status().await.unwrap()[1].current_version, 7);

    control.rollback(StoreId::Secondary, 5, true).await.unwrap();
    assert_eq!(control.migration_status().await.unwrap()[1].current_version, 5);
    let scripts = harness.secondary.applied_scripts().await;
    assert_eq!(
        scripts[scripts.len() - 2..],
        ["ALTER visits DROP notes".to_string(), "ALTER visits DROP c6".to_string()]
    );
}
