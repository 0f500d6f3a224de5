//! Migration commands.

use super::{format_timestamp, Session};
use pawsync_core::MigrationRunner;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

fn runner(path: &Path, user: &str) -> Result<MigrationRunner, Box<dyn std::error::Error>> {
    let session = Session::open(path)?;
    Ok(MigrationRunner::with_builtin(
        Arc::clone(&session.store),
        Arc::clone(&session.clock),
        user,
    )?)
}

/// Shows applied and pending steps.
pub fn status(path: &Path, user: &str) -> Result<(), Box<dyn std::error::Error>> {
    info!("Checking migration status for {:?}", path);
    let runner = runner(path, user)?;
    let status = runner.status()?;
    let ledger = runner.ledger()?;

    println!("Migration Status");
    println!("================");
    println!("  Current version: {}", status.current_version);
    println!("  Latest version:  {}", status.latest_version);

    if !ledger.applied.is_empty() {
        println!("\nApplied:");
        for step in &ledger.applied {
            println!(
                "  v{}: {} (applied at {})",
                step.version,
                step.name,
                format_timestamp(step.applied_at)
            );
        }
    }
    if !status.pending.is_empty() {
        println!("\nPending:");
        for step in &status.pending {
            println!("  v{}: {}", step.version, step.name);
            if let Some(description) = &step.description {
                println!("      {}", description);
            }
        }
    }
    if let Some(failed) = &status.failed {
        println!(
            "\n✗ v{} ({}) failed at {}: {}",
            failed.version,
            failed.name,
            format_timestamp(failed.failed_at),
            failed.error
        );
        println!("  Sync is blocked until `migrate run` succeeds.");
    }
    Ok(())
}

/// Applies every pending step.
pub fn run(path: &Path, user: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runner = runner(path, user)?;
    let result = runner.migrate_to_latest()?;

    if result.steps.is_empty() {
        println!("Already at v{}", result.final_version);
        return Ok(());
    }
    for step in &result.steps {
        if step.success {
            println!("  ✓ v{}: {}", step.version, step.name);
        } else {
            println!(
                "  ✗ v{}: {}: {}",
                step.version,
                step.name,
                step.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!(
        "\nv{} -> v{} ({} applied)",
        result.from_version, result.final_version, result.applied_count
    );

    if result.is_success() {
        Ok(())
    } else {
        Err("Migration failed".into())
    }
}
