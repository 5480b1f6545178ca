use duet_core::StoreId;

use crate::commands::common::{format_ledger_lines, open_surface, print_json, ResolvedPaths};
use crate::error::CliError;

pub async fn run_migrate_status(as_json: bool, paths: &ResolvedPaths) -> Result<(), CliError> {
    let surface = open_surface(paths)?;
    let statuses = surface.migration_status().await?;

    if as_json {
        return print_json(&statuses);
    }
    for status in &statuses {
        for line in format_ledger_lines(status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_migrate_up(
    store: StoreId,
    target: Option<u32>,
    paths: &ResolvedPaths,
) -> Result<(), CliError> {
    let surface = open_surface(paths)?;
    let applied = surface.migrate_up(store, target).await?;
    if applied.is_empty() {
        println!("{store} store is up to date");
    }
    for application in &applied {
        println!("Applied v{} to {store} store", application.version);
    }
    Ok(())
}

pub async fn run_migrate_plan(store: StoreId, target: u32, paths: &ResolvedPaths) -> Result<(), CliError> {
    let surface = open_surface(paths)?;
    let plan = surface.rollback_plan(store, target).await?;
    if plan.steps.is_empty() {
        println!("Nothing to roll back on {store} store above v{target}");
        return Ok(());
    }
    println!("Rolling {store} store back to v{target} would undo:");
    for step in &plan.steps {
        let mut notes = Vec::new();
        if step.destructive {
            notes.push("destructive");
        }
        if !step.reversible {
            notes.push("no down-script");
        }
        println!("  v{} {} {}", step.version, step.name, notes.join(", "));
    }
    Ok(())
}

pub async fn run_migrate_rollback(
    store: StoreId,
    target: u32,
    accept_destructive: bool,
    paths: &ResolvedPaths,
) -> Result<(), CliError> {
    let surface = open_surface(paths)?;
    let plan = surface.rollback(store, target, accept_destructive).await?;
    println!(
        "Rolled {store} store back to v{target} ({} steps undone)",
        plan.steps.len()
    );
    Ok(())
}

pub async fn run_migrate_clear_halt(store: StoreId, paths: &ResolvedPaths) -> Result<(), CliError> {
    let surface = open_surface(paths)?;
    if surface.clear_migration_halt(store).await? {
        println!("Migration halt on {store} store cleared");
    } else {
        println!("{store} store was not halted");
    }
    Ok(())
}
