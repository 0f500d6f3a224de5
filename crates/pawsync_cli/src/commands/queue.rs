//! Change queue commands.

use super::{format_timestamp, Session};
use pawsync_protocol::{QueueItem, QueueStatus};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct QueueReport {
    status: QueueStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    items: Option<Vec<QueueItem>>,
}

/// Summarizes the queue.
pub fn status(path: &Path, list_items: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let queue = Session::open(path)?.queue()?;
    let report = QueueReport {
        status: queue.status(),
        items: list_items.then(|| queue.items()),
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let status = &report.status;
    println!("Change Queue");
    println!("============");
    println!("  Total:     {}", status.total_items);
    println!("  Pending:   {}", status.pending_items);
    println!("  In flight: {}", status.in_flight_items);
    println!("  Failed:    {}", status.failed_items);
    println!("  Priority:  {}", status.priority_items);
    println!("  Bytes:     {}", status.queue_size_bytes);
    if let Some(oldest) = status.oldest_item {
        println!("  Oldest:    {}", format_timestamp(oldest));
    }
    if let Some(ms) = status.estimated_sync_millis {
        println!("  Estimated sync time: {} ms", ms);
    }
    for (entity_type, count) in &status.items_by_type {
        println!("    {:<14} {}", entity_type, count);
    }

    if let Some(items) = &report.items {
        println!();
        for item in items {
            println!(
                "  #{} {} {:?} {:?} attempts={}{}",
                item.seq,
                item.entity_ref(),
                item.operation,
                item.status,
                item.attempt_count,
                item.conflict_id
                    .as_deref()
                    .map(|c| format!(" parked on {c}"))
                    .unwrap_or_default()
            );
            if let Some(error) = &item.last_error {
                println!("      last error: {}", error);
            }
        }
    }
    Ok(())
}

/// Returns failed items that are not parked to pending.
pub fn retry_failed(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let queue = Session::open(path)?.queue()?;
    let count = queue.retry_failed()?;
    println!("{} failed item(s) returned to pending", count);
    Ok(())
}
