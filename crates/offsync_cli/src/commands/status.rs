//! Status command implementation.

use super::{format_millis, format_size, open, CliResult};
use serde::Serialize;
use std::path::Path;

/// Store status report.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Store path.
    pub path: String,
    /// File size in bytes.
    pub file_bytes: u64,
    /// Bytes held by live entries.
    pub live_bytes: u64,
    /// Live keys.
    pub keys: usize,
    /// Operations not yet confirmed by the remote.
    pub pending: u64,
    /// Operations that need a user decision.
    pub failed: u64,
    /// Earliest scheduled retry, in ms since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<u64>,
    /// Cached rows per table.
    pub tables: Vec<TableStats>,
}

/// Cached rows of one table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table name.
    pub table: String,
    /// Cached rows.
    pub rows: usize,
}

/// Builds the status report for the store at `path`.
pub fn collect(path: &Path) -> CliResult<StatusReport> {
    let store = open(path)?;
    let stats = store.file.stats();
    let (pending, failed) = store.log.counts();

    let tables = store
        .cache
        .tables()
        .into_iter()
        .map(|table| TableStats {
            rows: store.cache.get_records(&table).len(),
            table,
        })
        .collect();

    Ok(StatusReport {
        path: path.display().to_string(),
        file_bytes: stats.file_bytes,
        live_bytes: stats.live_bytes,
        keys: stats.keys,
        pending,
        failed,
        next_retry_at: store.log.next_attempt_at(),
        tables,
    })
}

/// Runs the status command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let report = collect(path)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_text(&report),
    }

    Ok(())
}

fn print_text(report: &StatusReport) {
    println!("Store: {}", report.path);
    println!();
    println!("Storage:");
    println!("  File size:   {}", format_size(report.file_bytes));
    println!("  Live data:   {}", format_size(report.live_bytes));
    println!("  Keys:        {}", report.keys);
    println!();
    println!("Sync:");
    println!("  Pending:     {}", report.pending);
    println!("  Failed:      {}", report.failed);
    if let Some(at) = report.next_retry_at {
        println!("  Next retry:  {}", format_millis(at));
    }

    if !report.tables.is_empty() {
        println!();
        println!("Cache:");
        println!("  {:<24} {:>8}", "Table", "Rows");
        println!("  {:-<24} {:->8}", "", "");
        for table in &report.tables {
            println!("  {:<24} {:>8}", table.table, table.rows);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::seeded_store;
    use tempfile::tempdir;

    #[test]
    fn reports_counts_and_tables() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        seeded_store(&path);

        let report = collect(&path).unwrap();
        assert_eq!(report.pending, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.tables.len(), 1);
        assert_eq!(report.tables[0].table, "tasks");
        assert_eq!(report.tables[0].rows, 3);
        assert!(report.file_bytes >= report.live_bytes);
    }

    #[test]
    fn store_held_by_engine_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        seeded_store(&path);
        let _held = offsync_storage::FileStore::open(&path).unwrap();

        let err = collect(&path).unwrap_err();
        assert!(matches!(
            err,
            crate::commands::CliError::Storage(offsync_storage::StorageError::Locked(_))
        ));
    }

    #[test]
    fn missing_store_is_reported() {
        let dir = tempdir().unwrap();
        let err = collect(&dir.path().join("absent.db")).unwrap_err();
        assert!(matches!(err, crate::commands::CliError::NotFound(_)));
    }
}
