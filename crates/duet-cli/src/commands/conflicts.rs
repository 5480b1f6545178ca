use duet_core::models::{Choice, ResolutionStatus};
use serde_json::Value;

use crate::cli::KeepSide;
use crate::commands::common::{
    format_conflict_lines, open_surface, parse_tenant, print_json, ResolvedPaths,
};
use crate::error::CliError;

pub async fn run_conflicts_list(
    tenant: &str,
    status: Option<&str>,
    limit: usize,
    as_json: bool,
    paths: &ResolvedPaths,
) -> Result<(), CliError> {
    let status = status
        .map(|status| status.trim().parse::<ResolutionStatus>())
        .transpose()?;
    let surface = open_surface(paths)?;
    let conflicts = surface
        .conflicts(&parse_tenant(tenant)?, status, limit)
        .await?;

    if as_json {
        return print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("No conflicts recorded.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_resolve(
    tenant: &str,
    id: i64,
    keep: Option<KeepSide>,
    fields: Option<&str>,
    paths: &ResolvedPaths,
) -> Result<(), CliError> {
    let choice = parse_choice(keep, fields)?;
    let surface = open_surface(paths)?;
    let conflict = surface
        .resolve_conflict(&parse_tenant(tenant)?, id, choice)
        .await?;
    println!(
        "Conflict #{} on {}/{} resolved; the next sync pass writes it to both stores",
        conflict.id, conflict.table, conflict.primary_key
    );
    Ok(())
}

pub fn parse_choice(keep: Option<KeepSide>, fields: Option<&str>) -> Result<Choice, CliError> {
    if let Some(side) = keep {
        return Ok(side.into());
    }
    let raw = fields.ok_or(CliError::NoChoice)?;
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(fields) => Ok(Choice::Replace(fields)),
        _ => Err(CliError::FieldsNotAnObject),
    }
}
