use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use duet_core::models::Choice;
use duet_core::StoreId;

#[derive(Parser)]
#[command(name = "duet")]
#[command(about = "Keep a primary store and an offline-capable local store converged")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub paths: PathArgs,
}

/// Database locations; each falls back to its env var, then the data dir
#[derive(Args, Debug, Clone, Default)]
pub struct PathArgs {
    /// Primary store database file
    #[arg(long, global = true, value_name = "PATH")]
    pub primary_db: Option<PathBuf>,

    /// Secondary (local) store database file
    #[arg(long, global = true, value_name = "PATH")]
    pub secondary_db: Option<PathBuf>,

    /// Control database holding cursors, conflicts, the queue and the ledger
    #[arg(long, global = true, value_name = "PATH")]
    pub control_db: Option<PathBuf>,

    /// Directory of migration step files (*.json)
    #[arg(long, global = true, value_name = "DIR")]
    pub migrations_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run periodic sync, connectivity probing and queue draining until Ctrl-C
    Run,
    /// Run one sync pass now
    Sync {
        /// Tenant to sync; every known tenant when omitted
        #[arg(long)]
        tenant: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show cursors, backlog, conflicts and recent failures of a tenant
    Status {
        #[arg(long)]
        tenant: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect and resolve conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Inspect and manage the offline write queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Apply, inspect and roll back schema migrations
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },
    /// Remove expired tombstones and applied queue entries
    Purge,
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List recorded conflicts, newest first
    List {
        #[arg(long)]
        tenant: String,
        /// Only conflicts in this state (auto_resolved, pending_manual, resolved_manual)
        #[arg(long)]
        status: Option<String>,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle a pending conflict; the next pass writes the choice to both stores
    Resolve {
        #[arg(long)]
        tenant: String,
        /// Conflict id
        id: i64,
        /// Keep one side's copy
        #[arg(long, value_enum, conflicts_with = "fields", required_unless_present = "fields")]
        keep: Option<KeepSide>,
        /// Replace both copies with this JSON object
        #[arg(long, value_name = "JSON")]
        fields: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List queued operations
    Show {
        #[arg(long)]
        tenant: String,
        /// Only operations in this state (pending, applied, failed)
        #[arg(long)]
        status: Option<String>,
        /// Number of operations to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Count operations by status and kind
    Stats {
        #[arg(long)]
        tenant: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Drop pending and failed operations
    Clear {
        #[arg(long)]
        tenant: String,
        /// Only this table
        #[arg(long)]
        table: Option<String>,
        /// Confirm the irreversible removal
        #[arg(long)]
        yes: bool,
    },
    /// Replay pending operations against the primary now
    Drain {
        /// Only this tenant
        #[arg(long)]
        tenant: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Show applied and pending steps for both stores
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply pending steps to one store
    Up {
        #[arg(value_enum)]
        store: StoreArg,
        /// Highest version to apply; latest when omitted
        #[arg(long)]
        target: Option<u32>,
    },
    /// Show what a rollback would undo without running it
    Plan {
        #[arg(value_enum)]
        store: StoreArg,
        /// Version to roll back to (kept applied)
        target: u32,
    },
    /// Roll one store back to a version
    Rollback {
        #[arg(value_enum)]
        store: StoreArg,
        /// Version to roll back to (kept applied)
        target: u32,
        /// Proceed even though some steps lose data
        #[arg(long)]
        accept_destructive: bool,
    },
    /// Lift an integrity halt after the catalog was repaired
    ClearHalt {
        #[arg(value_enum)]
        store: StoreArg,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StoreArg {
    Primary,
    Secondary,
}

impl From<StoreArg> for StoreId {
    fn from(store: StoreArg) -> Self {
        match store {
            StoreArg::Primary => Self::Primary,
            StoreArg::Secondary => Self::Secondary,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepSide {
    Primary,
    Secondary,
}

impl From<KeepSide> for Choice {
    fn from(side: KeepSide) -> Self {
        match side {
            KeepSide::Primary => Self::KeepPrimary,
            KeepSide::Secondary => Self::KeepSecondary,
        }
    }
}
