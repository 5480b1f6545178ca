//! Duet CLI - operate the sync engine from the command line
//!
//! Runs the background worker, triggers passes and exposes conflicts, the
//! offline queue and the migration ledger to operators.

mod cli;
mod commands;
mod error;

#[cfg(test)]
mod tests;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ConflictCommands, MigrateCommands, QueueCommands};
use crate::commands::common::resolve_paths;
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve};
use crate::commands::migrate::{
    run_migrate_clear_halt, run_migrate_plan, run_migrate_rollback, run_migrate_status,
    run_migrate_up,
};
use crate::commands::purge::run_purge;
use crate::commands::queue::{run_queue_clear, run_queue_drain, run_queue_show, run_queue_stats};
use crate::commands::run::run_worker;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("duet_core=info,duet=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = resolve_paths(&cli.paths);

    match cli.command {
        Commands::Run => run_worker(&paths).await?,
        Commands::Sync { tenant, json } => run_sync(tenant.as_deref(), json, &paths).await?,
        Commands::Status { tenant, json } => run_status(&tenant, json, &paths).await?,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List {
                tenant,
                status,
                limit,
                json,
            } => run_conflicts_list(&tenant, status.as_deref(), limit, json, &paths).await?,
            ConflictCommands::Resolve {
                tenant,
                id,
                keep,
                fields,
            } => run_conflicts_resolve(&tenant, id, keep, fields.as_deref(), &paths).await?,
        },
        Commands::Queue { command } => match command {
            QueueCommands::Show {
                tenant,
                status,
                limit,
                json,
            } => run_queue_show(&tenant, status.as_deref(), limit, json, &paths).await?,
            QueueCommands::Stats { tenant, json } => run_queue_stats(&tenant, json, &paths).await?,
            QueueCommands::Clear { tenant, table, yes } => {
                run_queue_clear(&tenant, table.as_deref(), yes, &paths).await?;
            }
            QueueCommands::Drain { tenant } => run_queue_drain(tenant.as_deref(), &paths).await?,
        },
        Commands::Migrate { command } => match command {
            MigrateCommands::Status { json } => run_migrate_status(json, &paths).await?,
            MigrateCommands::Up { store, target } => {
                run_migrate_up(store.into(), target, &paths).await?;
            }
            MigrateCommands::Plan { store, target } => {
                run_migrate_plan(store.into(), target, &paths).await?;
            }
            MigrateCommands::Rollback {
                store,
                target,
                accept_destructive,
            } => run_migrate_rollback(store.into(), target, accept_destructive, &paths).await?,
            MigrateCommands::ClearHalt { store } => {
                run_migrate_clear_halt(store.into(), &paths).await?;
            }
        },
        Commands::Purge => run_purge(&paths).await?,
    }

    Ok(())
}
