//! Compact command implementation.

use super::{format_size, CliError, CliResult};
use offsync_storage::{FileStore, FileStoreStats};
use std::path::Path;

/// Size before and after compaction.
#[derive(Debug)]
pub struct CompactStats {
    /// Stats before compaction.
    pub before: FileStoreStats,
    /// Stats after compaction; equal to `before` on a dry run.
    pub after: FileStoreStats,
}

impl CompactStats {
    /// Bytes reclaimed.
    pub fn saved(&self) -> u64 {
        self.before.file_bytes.saturating_sub(self.after.file_bytes)
    }
}

/// Compacts the store at `path` unless `dry_run` is set.
pub fn apply(path: &Path, dry_run: bool) -> CliResult<CompactStats> {
    if !path.exists() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    let store = FileStore::open(path)?;
    let before = store.stats();
    if dry_run {
        return Ok(CompactStats {
            before,
            after: before,
        });
    }
    store.compact()?;
    Ok(CompactStats {
        before,
        after: store.stats(),
    })
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> CliResult<()> {
    println!("Compacting store at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = apply(path, dry_run)?;
    let reclaimable = stats.before.file_bytes.saturating_sub(stats.before.live_bytes);

    println!("  Keys:        {}", stats.before.keys);
    println!("  File size:   {}", format_size(stats.before.file_bytes));
    println!("  Live data:   {}", format_size(stats.before.live_bytes));
    println!("  Reclaimable: {}", format_size(reclaimable));

    if !dry_run {
        println!();
        if stats.saved() > 0 {
            println!("✓ Compaction complete, saved {}", format_size(stats.saved()));
        } else {
            println!("No compaction needed - store is already compact");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::seeded_store;
    use crate::commands::retry;
    use tempfile::tempdir;

    #[test]
    fn compaction_keeps_live_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        seeded_store(&path);
        // Rewrites leave dead frames behind.
        retry::apply(&path, None).unwrap();

        let dry = apply(&path, true).unwrap();
        assert_eq!(dry.saved(), 0);
        assert!(dry.before.file_bytes > dry.before.live_bytes);

        let stats = apply(&path, false).unwrap();
        assert!(stats.saved() > 0);
        assert_eq!(stats.after.keys, stats.before.keys);

        let queue = crate::commands::queue::collect(&path, false).unwrap();
        assert_eq!(queue.len(), 3);
    }
}
