//! PawSync CLI
//!
//! Maintenance tools for a PawSync local store.
//!
//! # Commands
//!
//! - `inspect` - Display store statistics, sync state and queue summary
//! - `verify` - Run an integrity check
//! - `migrate` - Show or apply schema migrations
//! - `queue` - Inspect the change queue or retry failed items
//! - `conflicts` - List or resolve conflict records
//! - `compact` - Rewrite the store log without dead frames

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// PawSync command-line store tools.
#[derive(Parser)]
#[command(name = "pawsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// User whose sync state to read
    #[arg(global = true, short, long, default_value = "local")]
    user: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store statistics, sync state and queue summary
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run an integrity check
    Verify {
        /// Check depth
        #[arg(short, long, value_enum, default_value_t = CheckArg::Full)]
        check: CheckArg,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show or apply schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Inspect the change queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// List or resolve conflict records
    Conflicts {
        #[command(subcommand)]
        action: ConflictAction,
    },

    /// Rewrite the store log without dead frames
    Compact {
        /// Only report what would be reclaimed
        #[arg(long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Show applied and pending steps
    Status,
    /// Apply every pending step
    Run,
}

#[derive(Subcommand)]
enum QueueAction {
    /// Summarize the queue
    Status {
        /// List every item
        #[arg(short, long)]
        items: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Return failed items that are not parked to pending
    RetryFailed,
}

#[derive(Subcommand)]
enum ConflictAction {
    /// List conflict records
    List {
        /// Include resolved records
        #[arg(short, long)]
        all: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Settle a conflict awaiting manual review
    Resolve {
        /// Conflict record id
        id: String,

        /// Which side to keep
        #[arg(short, long, value_enum, conflicts_with = "payload")]
        keep: Option<commands::conflicts::Keep>,

        /// Replacement payload as JSON
        #[arg(long)]
        payload: Option<String>,

        /// Who made the decision
        #[arg(short, long, default_value = "cli")]
        by: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum CheckArg {
    Quick,
    Full,
    Deep,
    Repair,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, &cli.user, &format)?;
        }
        Commands::Verify { check, format } => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path, check.into(), &format)?;
        }
        Commands::Migrate { action } => {
            let path = cli.path.ok_or("Store path required for migrate")?;
            match action {
                MigrateAction::Status => commands::migrate::status(&path, &cli.user)?,
                MigrateAction::Run => commands::migrate::run(&path, &cli.user)?,
            }
        }
        Commands::Queue { action } => {
            let path = cli.path.ok_or("Store path required for queue")?;
            match action {
                QueueAction::Status { items, format } => {
                    commands::queue::status(&path, items, &format)?
                }
                QueueAction::RetryFailed => commands::queue::retry_failed(&path)?,
            }
        }
        Commands::Conflicts { action } => {
            let path = cli.path.ok_or("Store path required for conflicts")?;
            match action {
                ConflictAction::List { all, format } => {
                    commands::conflicts::list(&path, all, &format)?
                }
                ConflictAction::Resolve {
                    id,
                    keep,
                    payload,
                    by,
                } => {
                    let choice = commands::conflicts::choice(keep, payload.as_deref())?;
                    commands::conflicts::resolve(&path, &id, choice, &by)?;
                }
            }
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("PawSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Store schema v{}", pawsync_core::LATEST_SCHEMA_VERSION);
        }
    }

    Ok(())
}

impl From<CheckArg> for pawsync_protocol::CheckType {
    fn from(arg: CheckArg) -> Self {
        match arg {
            CheckArg::Quick => Self::Quick,
            CheckArg::Full => Self::Full,
            CheckArg::Deep => Self::Deep,
            CheckArg::Repair => Self::Repair,
        }
    }
}
