use crate::commands::common::{format_pass_lines, open_surface, parse_tenant, print_json, ResolvedPaths};
use crate::error::CliError;

pub async fn run_sync(
    tenant: Option<&str>,
    as_json: bool,
    paths: &ResolvedPaths,
) -> Result<(), CliError> {
    let surface = open_surface(paths)?;
    let reports = match tenant {
        Some(tenant) => vec![surface.trigger_sync(&parse_tenant(tenant)?).await?],
        None => surface.sync_all().await?,
    };

    if as_json {
        print_json(&reports)?;
    } else if reports.is_empty() {
        println!("No tenants to sync.");
    } else {
        for report in &reports {
            for line in format_pass_lines(report) {
                println!("{line}");
            }
        }
    }

    // A failed table keeps its cursors; surface it through the exit code.
    if let Some(report) = reports.iter().find(|report| !report.failed_tables().is_empty()) {
        return Err(CliError::PassIncomplete(
            report.tenant.to_string(),
            report.failed_tables().join(", "),
        ));
    }
    Ok(())
}
