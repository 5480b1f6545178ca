use crate::commands::common::{open_surface, ResolvedPaths};
use crate::error::CliError;

pub async fn run_purge(paths: &ResolvedPaths) -> Result<(), CliError> {
    let surface = open_surface(paths)?;
    let report = surface.purge().await?;
    println!(
        "Purged {} primary and {} secondary tombstones, {} applied queue entries",
        report.tombstones_primary, report.tombstones_secondary, report.operations
    );
    Ok(())
}
