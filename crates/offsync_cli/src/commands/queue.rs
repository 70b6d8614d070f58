//! Queue command implementation.

use super::{format_millis, open, CliResult};
use offsync_protocol::QueuedOperation;
use std::path::Path;

/// Returns the queued operations of the store at `path` in log order.
pub fn collect(path: &Path, failed_only: bool) -> CliResult<Vec<QueuedOperation>> {
    let store = open(path)?;
    Ok(if failed_only {
        store.log.failed_operations()
    } else {
        store.log.operations()
    })
}

/// Runs the queue command.
pub fn run(path: &Path, failed_only: bool, format: &str) -> CliResult<()> {
    let ops = collect(path, failed_only)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&ops)?);
        return Ok(());
    }

    if ops.is_empty() {
        println!("No queued operations");
        return Ok(());
    }

    println!(
        "{:>8}  {:<7} {:<18} {:<24} {:>8}  Last error",
        "Op", "Kind", "Status", "Row", "Attempts"
    );
    for op in &ops {
        let row = format!("{}/{}", op.table, op.record_id());
        println!(
            "{:>8}  {:<7} {:<18} {:<24} {:>8}  {}",
            op.op_id,
            op.kind.to_string(),
            op.status.to_string(),
            row,
            op.attempts,
            op.last_error.as_deref().unwrap_or("-")
        );
        if let Some(at) = op.next_attempt_at {
            println!("{:>8}  next attempt at {}", "", format_millis(at));
        }
    }
    println!();
    println!("{} operation(s)", ops.len());

    Ok(())
}
