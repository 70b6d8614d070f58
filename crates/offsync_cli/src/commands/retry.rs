//! Retry-failed command implementation.

use super::{open, CliResult};
use offsync_protocol::OpId;
use std::path::Path;

/// Moves failed operations back to pending. Returns how many moved.
pub fn apply(path: &Path, op: Option<u64>) -> CliResult<usize> {
    let store = open(path)?;
    match op {
        Some(id) => {
            store.log.retry(OpId(id))?;
            Ok(1)
        }
        None => Ok(store.log.retry_all_failed()?),
    }
}

/// Runs the retry-failed command.
pub fn run(path: &Path, op: Option<u64>) -> CliResult<()> {
    let moved = apply(path, op)?;
    tracing::info!(operations = moved, "operations moved back to pending");
    println!("✓ {} operation(s) will be retried on the next sync", moved);
    Ok(())
}
