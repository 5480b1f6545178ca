use duet_core::models::OperationStatus;

use crate::commands::common::{
    format_operation_lines, open_surface, parse_tenant, print_json, ResolvedPaths,
};
use crate::error::CliError;

pub async fn run_queue_show(
    tenant: &str,
    status: Option<&str>,
    limit: usize,
    as_json: bool,
    paths: &ResolvedPaths,
) -> Result<(), CliError> {
    let status = status
        .map(|status| status.trim().parse::<OperationStatus>())
        .transpose()?;
    let surface = open_surface(paths)?;
    let operations = surface
        .queue_backlog(&parse_tenant(tenant)?, status, limit)
        .await?;

    if as_json {
        return print_json(&operations);
    }
    if operations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for line in format_operation_lines(&operations) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_queue_stats(tenant: &str, as_json: bool, paths: &ResolvedPaths) -> Result<(), CliError> {
    let surface = open_surface(paths)?;
    let stats = surface.queue_stats(&parse_tenant(tenant)?).await?;

    if as_json {
        return print_json(&stats);
    }
    if stats.is_empty() {
        println!("Queue is empty.");
    }
    for count in &stats {
        println!("{:<8} {:<7} {}", count.status.as_str(), count.op.as_str(), count.count);
    }
    Ok(())
}

pub async fn run_queue_clear(
    tenant: &str,
    table: Option<&str>,
    confirmed: bool,
    paths: &ResolvedPaths,
) -> Result<(), CliError> {
    if !confirmed {
        return Err(CliError::ClearNotConfirmed);
    }
    let surface = open_surface(paths)?;
    let removed = surface.clear_queue(&parse_tenant(tenant)?, table).await?;
    println!("Removed {removed} queued operations");
    Ok(())
}

pub async fn run_queue_drain(tenant: Option<&str>, paths: &ResolvedPaths) -> Result<(), CliError> {
    let tenant = tenant.map(parse_tenant).transpose()?;
    let surface = open_surface(paths)?;
    let report = surface.drain_queue(tenant.as_ref()).await?;

    for partition in &report.partitions {
        println!(
            "{}/{}: applied {}, already present {}, superseded {}, resolved {}, escalated {}, blocked {}",
            partition.tenant,
            partition.table,
            partition.applied,
            partition.already_applied,
            partition.superseded,
            partition.resolved,
            partition.escalated,
            partition.blocked
        );
    }
    println!(
        "Drained {} operations, {} escalated to manual review",
        report.applied(),
        report.escalated()
    );
    Ok(())
}
