//! offsync CLI
//!
//! Command-line tools for offsync store files.
//!
//! All commands work offline on the store file an engine persists to; none
//! of them talk to a remote. A store held open by a running engine is locked
//! and the command fails.
//!
//! # Commands
//!
//! - `status` - Sync status and store statistics
//! - `queue` - List queued operations
//! - `cache` - List cached rows of a table
//! - `retry-failed` - Move permanently failed operations back to pending
//! - `discard` - Drop permanently failed operations
//! - `compact` - Rewrite the store file without dead entries

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// offsync command-line store tools.
#[derive(Parser)]
#[command(name = "offsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show sync status and store statistics
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queued operations in log order
    Queue {
        /// Only show permanently failed operations
        #[arg(long)]
        failed: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List cached rows of a table
    Cache {
        /// Table name
        table: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Move permanently failed operations back to pending
    RetryFailed {
        /// Only retry this operation
        #[arg(long)]
        op: Option<u64>,
    },

    /// Drop permanently failed operations without sending them
    Discard {
        /// Operation to drop
        op: Option<u64>,

        /// Drop every permanently failed operation
        #[arg(long)]
        all_failed: bool,
    },

    /// Rewrite the store file without dead entries
    Compact {
        /// Dry run - show what would be done
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Status { format } => {
            let path = cli.path.ok_or("Store path required for status")?;
            commands::status::run(&path, &format)?;
        }
        Commands::Queue { failed, format } => {
            let path = cli.path.ok_or("Store path required for queue")?;
            commands::queue::run(&path, failed, &format)?;
        }
        Commands::Cache { table, format } => {
            let path = cli.path.ok_or("Store path required for cache")?;
            commands::cache::run(&path, &table, &format)?;
        }
        Commands::RetryFailed { op } => {
            let path = cli.path.ok_or("Store path required for retry-failed")?;
            commands::retry::run(&path, op)?;
        }
        Commands::Discard { op, all_failed } => {
            let path = cli.path.ok_or("Store path required for discard")?;
            if op.is_none() && !all_failed {
                return Err("Pass an operation id or --all-failed".into());
            }
            commands::discard::run(&path, op, all_failed)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Version => {
            println!("offsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
