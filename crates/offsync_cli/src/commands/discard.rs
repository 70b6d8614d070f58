//! Discard command implementation.

use super::{open, CliResult, OpenStore};
use offsync_protocol::OpId;
use std::path::Path;

/// Drops permanently failed operations. Returns how many were dropped.
///
/// A cached row left with no queued write is removed, since the optimistic
/// value it holds was never confirmed.
pub fn apply(path: &Path, op: Option<u64>, all_failed: bool) -> CliResult<usize> {
    let store = open(path)?;
    let targets: Vec<OpId> = if all_failed {
        store.log.failed_operations().iter().map(|op| op.op_id).collect()
    } else {
        op.map(OpId).into_iter().collect()
    };

    for op_id in &targets {
        discard_one(&store, *op_id)?;
    }
    Ok(targets.len())
}

fn discard_one(store: &OpenStore, op_id: OpId) -> CliResult<()> {
    let op = store.log.discard(op_id)?;
    let key = op.key();
    if !store.log.has_unapplied_for(&key) {
        store.cache.remove(&key)?;
    }
    tracing::debug!(op_id = %op_id, table = %key.table, id = %key.id, "operation discarded");
    Ok(())
}

/// Runs the discard command.
pub fn run(path: &Path, op: Option<u64>, all_failed: bool) -> CliResult<()> {
    let dropped = apply(path, op, all_failed)?;
    println!("✓ Discarded {} operation(s)", dropped);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::seeded_store;
    use offsync_protocol::RecordKey;
    use tempfile::tempdir;

    #[test]
    fn discard_all_failed_drops_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        seeded_store(&path);

        assert_eq!(apply(&path, None, true).unwrap(), 1);

        let store = open(&path).unwrap();
        assert_eq!(store.log.counts(), (2, 0));
        assert!(store.cache.get(&RecordKey::new("tasks", "c")).is_none());
        assert!(store.cache.get(&RecordKey::new("tasks", "a")).is_some());
    }

    #[test]
    fn discard_unknown_operation_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");
        seeded_store(&path);

        assert!(apply(&path, Some(99), false).is_err());
    }
}
