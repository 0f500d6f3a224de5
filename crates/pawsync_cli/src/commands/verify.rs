//! Verify command implementation.

use super::Session;
use pawsync_core::IntegrityChecker;
use pawsync_protocol::{CheckType, IntegrityCheckResult};
use std::path::Path;
use std::sync::Arc;

/// Runs the verify command. Fails when issues remain unfixed.
pub fn run(
    path: &Path,
    check_type: CheckType,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::open(path)?;
    let checker = IntegrityChecker::new(
        Arc::clone(&session.store),
        session.queue()?,
        Arc::clone(&session.clock),
    );
    let result = checker.run_check(check_type)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_result(path, &result),
    }

    if result.issues_found > result.issues_fixed {
        Err("Verification failed".into())
    } else {
        Ok(())
    }
}

fn print_result(path: &Path, result: &IntegrityCheckResult) {
    println!("Verifying store at {:?} ({})", path, result.check_type);
    println!();
    println!(
        "  Items checked: {}, issues: {}, fixed: {}",
        result.items_checked, result.issues_found, result.issues_fixed
    );
    for issue in &result.issues {
        let marker = if issue.fixed { "FIXED" } else { "ERROR" };
        println!("    {}: {:?} at {}: {}", marker, issue.kind, issue.key, issue.detail);
    }
    for recommendation in &result.recommendations {
        println!("  -> {}", recommendation);
    }

    println!();
    if result.issues_found == result.issues_fixed {
        println!("✓ Store verification passed");
    } else {
        println!("✗ Store verification failed");
    }
}
