//! Compact command implementation.

use super::Session;
use std::path::Path;

/// Rewrites the store log without dead frames.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(path)?;
    let stats = session.store.stats()?;

    println!("Compacting store at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();
    println!("  Log size:    {} bytes", stats.log_bytes);
    println!(
        "  Reclaimable: {} bytes ({:.1}%)",
        stats.reclaimable_bytes,
        if stats.log_bytes > 0 {
            stats.reclaimable_bytes as f64 / stats.log_bytes as f64 * 100.0
        } else {
            0.0
        }
    );

    if dry_run {
        return Ok(());
    }
    if stats.reclaimable_bytes == 0 {
        println!();
        println!("No compaction needed - log holds live records only");
        return Ok(());
    }

    let reclaimed = session.store.compact()?;
    println!();
    println!("Compaction complete: {} bytes reclaimed", reclaimed);
    Ok(())
}
