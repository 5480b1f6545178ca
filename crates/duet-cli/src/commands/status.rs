use duet_core::control::SyncStatus;
use duet_core::util::format_timestamp;

use crate::commands::common::{format_pass_lines, open_surface, parse_tenant, print_json, ResolvedPaths};
use crate::error::CliError;

pub async fn run_status(tenant: &str, as_json: bool, paths: &ResolvedPaths) -> Result<(), CliError> {
    let surface = open_surface(paths)?;
    surface.refresh_connectivity().await;
    let status = surface.status(&parse_tenant(tenant)?).await?;

    if as_json {
        return print_json(&status);
    }
    for line in format_status_lines(&status) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    let mut lines = vec![
        format!("Tenant:        {}", status.tenant),
        format!("Primary:       {}", status.connectivity),
        format!(
            "Pass running:  {}",
            if status.pass_in_progress { "yes" } else { "no" }
        ),
        format!("Queue backlog: {}", status.queue_backlog),
    ];

    if status.cursors.is_empty() {
        lines.push("Cursors:       none yet".to_string());
    } else {
        lines.push("Cursors:".to_string());
        for cursor in &status.cursors {
            lines.push(format!(
                "  {:<16} {:<9} v{}  ({})",
                cursor.table,
                cursor.store.as_str(),
                cursor.version,
                format_timestamp(cursor.updated_at)
            ));
        }
    }

    if !status.conflicts.is_empty() {
        let counts = status
            .conflicts
            .iter()
            .map(|(state, count)| format!("{state}={count}"))
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(format!("Conflicts:     {counts}"));
    }

    match &status.last_pass {
        Some(report) => lines.extend(format_pass_lines(report)),
        None => lines.push("No pass since start-up.".to_string()),
    }

    for failed in &status.failed_batches {
        lines.push(format!(
            "Failed batch {} at {}: {} ({} attempts)",
            failed.table,
            format_timestamp(failed.failed_at),
            failed.error,
            failed.attempts
        ));
    }
    lines
}
