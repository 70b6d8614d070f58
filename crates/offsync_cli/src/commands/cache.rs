//! Cache command implementation.

use super::{open, CliResult};
use offsync_engine::validate_table;
use offsync_protocol::Record;
use std::path::Path;

/// Returns the cached rows of `table`.
pub fn collect(path: &Path, table: &str) -> CliResult<Vec<Record>> {
    validate_table(table)?;
    let store = open(path)?;
    Ok(store.cache.get_records(table))
}

/// Runs the cache command.
pub fn run(path: &Path, table: &str, format: &str) -> CliResult<()> {
    let records = collect(path, table)?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No cached rows in {table}");
        return Ok(());
    }

    for record in &records {
        println!(
            "{:<24} v{:<14} {}",
            record.id,
            record.version,
            serde_json::to_string(&record.payload)?
        );
    }
    println!();
    println!("{} row(s)", records.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::seeded_store;
    use tempfile::tempdir;

    #[test]
    fn lists_optimistic_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        seeded_store(&path);

        let rows = collect(&path, "tasks").unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(collect(&path, "notes").unwrap().is_empty());
    }

    #[test]
    fn rejects_invalid_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        seeded_store(&path);

        assert!(collect(&path, "a/b").is_err());
    }
}
