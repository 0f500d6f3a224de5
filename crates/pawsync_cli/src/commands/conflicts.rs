//! Conflict commands.

use super::{format_timestamp, Session};
use clap::ValueEnum;
use pawsync_core::{ConflictFilter, ConflictResolver, EngineConfig, PolicyTable};
use pawsync_protocol::{ConflictRecord, EntityPayload, ManualChoice};
use std::path::Path;
use std::sync::Arc;

/// Side to keep when settling a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Keep {
    /// Push the local payload.
    Local,
    /// Accept the server payload.
    Server,
}

/// Builds the manual choice from the command-line flags.
pub fn choice(
    keep: Option<Keep>,
    payload: Option<&str>,
) -> Result<ManualChoice, Box<dyn std::error::Error>> {
    match (keep, payload) {
        (_, Some(json)) => {
            let payload: EntityPayload = serde_json::from_str(json)?;
            Ok(ManualChoice::Custom(payload))
        }
        (Some(Keep::Local), None) => Ok(ManualChoice::KeepLocal),
        (Some(Keep::Server), None) => Ok(ManualChoice::KeepServer),
        (None, None) => Err("Either --keep or --payload is required".into()),
    }
}

fn resolver(path: &Path) -> Result<ConflictResolver, Box<dyn std::error::Error>> {
    let session = Session::open(path)?;
    let queue = session.queue()?;
    Ok(ConflictResolver::new(
        Arc::clone(&session.store),
        queue,
        PolicyTable::from_config(&EngineConfig::default()),
        Arc::clone(&session.clock),
    ))
}

/// Lists conflict records, unresolved only unless `all`.
pub fn list(path: &Path, all: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = if all {
        ConflictFilter::all()
    } else {
        ConflictFilter::unresolved()
    };
    let records = resolver(path)?.list_conflicts(&filter);

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

/// Settles a conflict awaiting manual review.
pub fn resolve(
    path: &Path,
    id: &str,
    choice: ManualChoice,
    resolved_by: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let record = resolver(path)?.resolve_manual(id, choice, resolved_by)?;
    println!("✓ Conflict {} resolved", record.id);
    print_record(&record);
    Ok(())
}

fn print_record(record: &ConflictRecord) {
    println!(
        "{} {} {:?} (local v{} vs server v{})",
        record.id,
        record.entity_ref(),
        record.resolution,
        record
            .base_version
            .map_or_else(|| "-".to_string(), |v| v.to_string()),
        record.server_version
    );
    println!("    created {}", format_timestamp(record.created_at));
    if !record.conflicting_fields.is_empty() {
        println!("    fields: {}", record.conflicting_fields.join(", "));
    }
    if let (Some(at), Some(by)) = (record.resolved_at, &record.resolved_by) {
        println!("    resolved {} by {}", format_timestamp(at), by);
    }
}
