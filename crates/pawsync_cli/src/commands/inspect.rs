//! Inspect command implementation.

use super::{format_timestamp, Session};
use pawsync_core::{ConflictFilter, ConflictResolver, EngineConfig, PolicyTable};
use pawsync_protocol::{QueueStatus, SyncStateRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Live records per keyspace.
    pub records: BTreeMap<&'static str, usize>,
    /// Bytes held by live records.
    pub live_bytes: u64,
    /// Bytes of log on disk.
    pub log_bytes: u64,
    /// Configured capacity.
    pub capacity_bytes: u64,
    /// Frames dropped while opening.
    pub replay_errors: usize,
    /// Sync state of the requested user.
    pub sync_state: Option<SyncStateRecord>,
    /// Change queue summary.
    pub queue: QueueStatus,
    /// Conflicts awaiting a decision.
    pub unresolved_conflicts: usize,
}

/// Runs the inspect command.
pub fn run(path: &Path, user: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(path)?;
    let stats = session.store.stats()?;
    let queue = session.queue()?;
    let resolver = ConflictResolver::new(
        Arc::clone(&session.store),
        Arc::clone(&queue),
        PolicyTable::from_config(&EngineConfig::new(user)),
        Arc::clone(&session.clock),
    );

    let result = InspectResult {
        path: path.display().to_string(),
        records: stats.records,
        live_bytes: stats.live_bytes,
        log_bytes: stats.log_bytes,
        capacity_bytes: stats.capacity_bytes,
        replay_errors: session.store.replay_errors().len(),
        sync_state: session.store.load_sync_state(user)?,
        queue: queue.status(),
        unresolved_conflicts: resolver.list_conflicts(&ConflictFilter::unresolved()).len(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Store: {}", result.path);
    println!(
        "  Size: {} live / {} on disk / {} capacity",
        result.live_bytes, result.log_bytes, result.capacity_bytes
    );
    if result.replay_errors > 0 {
        println!("  Replay errors: {} (run `verify --check repair`)", result.replay_errors);
    }
    println!();
    println!("Records:");
    for (keyspace, count) in &result.records {
        println!("  {:<16} {}", keyspace, count);
    }

    println!();
    match &result.sync_state {
        Some(state) => {
            println!("Sync state ({}):", state.user_id);
            match state.last_sync_timestamp {
                Some(ts) => println!("  Last sync: {}", format_timestamp(ts)),
                None => println!("  Last sync: never"),
            }
            println!("  In progress: {}", state.sync_in_progress);
            println!("  Consecutive failures: {}", state.consecutive_failures);
            if let Some(error) = &state.last_error {
                println!("  Last error: {}", error);
            }
            if let Some(reason) = &state.halted {
                println!("  HALTED: {}", reason);
            }
        }
        None => println!("Sync state: not initialized"),
    }

    println!();
    let queue = &result.queue;
    println!("Queue:");
    println!(
        "  {} items ({} pending, {} in flight, {} failed), {} bytes",
        queue.total_items,
        queue.pending_items,
        queue.in_flight_items,
        queue.failed_items,
        queue.queue_size_bytes
    );
    println!("  Unresolved conflicts: {}", result.unresolved_conflicts);
}
