use crate::commands::common::{open_surface, ResolvedPaths};
use crate::error::CliError;

/// Run the background worker until Ctrl-C, then stop it cleanly
pub async fn run_worker(paths: &ResolvedPaths) -> Result<(), CliError> {
    let mut surface = open_surface(paths)?;
    let task = surface.start_worker();
    tracing::info!("Worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down worker");
    surface.stop_worker().await?;
    if let Err(error) = task.await {
        tracing::error!(error = %error, "Worker task ended abnormally");
    }
    Ok(())
}
