//! Local cache store.

use crate::error::{SyncError, SyncResult};
use offsync_protocol::{CacheEntry, OperationKind, QueuedOperation, Record, RecordKey, Version};
use offsync_storage::PersistentStore;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const CACHE_PREFIX: &str = "cache/";

fn entry_key(table: &str, id: &str) -> String {
    format!("{CACHE_PREFIX}{table}/{id}")
}

/// Checks that a table name can be used as a cache key segment.
pub fn validate_table(table: &str) -> SyncResult<()> {
    if table.is_empty() {
        return Err(SyncError::invalid_record("table name is empty"));
    }
    if table.contains('/') {
        return Err(SyncError::invalid_record(format!(
            "table name `{table}` contains '/'"
        )));
    }
    Ok(())
}

/// Durable snapshot of the last-known rows of every table.
///
/// Reads are served from memory and never touch the store or the network.
/// Writes go to the store first, so the memory view never holds anything the
/// store does not.
///
/// Entries hold either an optimistic local write or the authoritative remote
/// row; the engine decides which by consulting the mutation log.
pub struct CacheStore {
    store: Arc<dyn PersistentStore>,
    tables: RwLock<HashMap<String, BTreeMap<String, CacheEntry>>>,
}

impl CacheStore {
    /// Loads every cached row from the store.
    ///
    /// Undecodable entries are skipped with a warning; the next refresh
    /// repopulates them.
    pub fn open(store: Arc<dyn PersistentStore>) -> SyncResult<Self> {
        let mut tables: HashMap<String, BTreeMap<String, CacheEntry>> = HashMap::new();
        let mut loaded = 0usize;

        for (key, bytes) in store.scan_prefix(CACHE_PREFIX)? {
            match CacheEntry::decode(&bytes) {
                Ok(entry) => {
                    tables
                        .entry(entry.table.clone())
                        .or_default()
                        .insert(entry.id.clone(), entry);
                    loaded += 1;
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable cache entry"),
            }
        }

        tracing::debug!(entries = loaded, tables = tables.len(), "cache loaded");
        Ok(Self {
            store,
            tables: RwLock::new(tables),
        })
    }

    /// Returns every cached row of `table`, ordered by id. Empty if none.
    pub fn get_records(&self, table: &str) -> Vec<Record> {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.values().map(CacheEntry::to_record).collect())
            .unwrap_or_default()
    }

    /// Returns every cached row of `table` deserialized as `T`.
    ///
    /// Rows that do not deserialize as `T` are skipped with a warning.
    pub fn get_from_cache<T: DeserializeOwned>(&self, table: &str) -> Vec<T> {
        self.get_records(table)
            .into_iter()
            .filter_map(|record| match record.to_row() {
                Ok(row) => Some(row),
                Err(e) => {
                    tracing::warn!(table, record_id = %record.id, error = %e, "cached row does not match requested type");
                    None
                }
            })
            .collect()
    }

    /// Returns one cached row.
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.tables
            .read()
            .get(&key.table)
            .and_then(|rows| rows.get(&key.id))
            .map(CacheEntry::to_record)
    }

    /// Returns the cached version of a row.
    pub fn version_of(&self, key: &RecordKey) -> Option<Version> {
        self.tables
            .read()
            .get(&key.table)
            .and_then(|rows| rows.get(&key.id))
            .map(|entry| entry.version)
    }

    /// Returns the names of all tables with cached rows.
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of cached rows across all tables.
    pub fn len(&self) -> usize {
        self.tables.read().values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merges remote rows into `table`, keeping the higher version per id.
    ///
    /// Returns how many rows were written.
    pub fn put(&self, table: &str, records: &[Record], now: u64) -> SyncResult<usize> {
        validate_table(table)?;
        let mut written = 0;
        for record in records.iter().filter(|r| r.table == table) {
            let newer = self
                .version_of(&record.key())
                .map_or(true, |current| record.version >= current);
            if newer {
                self.write(CacheEntry::from_record(record, now))?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Applies the effect of a queued operation ahead of remote confirmation.
    pub fn write_optimistic(&self, op: &QueuedOperation, now: u64) -> SyncResult<()> {
        match op.kind {
            OperationKind::Insert | OperationKind::Update => {
                self.write(CacheEntry::from_record(&op.record, now))
            }
            OperationKind::Delete => self.remove(&op.key()),
        }
    }

    /// Replays the log over the cache, oldest first.
    ///
    /// A crash between a log write and the matching cache write leaves the
    /// cache one step behind; this brings it back in line.
    pub fn overlay(&self, ops: &[QueuedOperation], now: u64) -> SyncResult<()> {
        for op in ops {
            let current = self.get(&op.key());
            let in_place = match op.kind {
                OperationKind::Delete => current.is_none(),
                _ => current.as_ref() == Some(&op.record),
            };
            if !in_place {
                self.write_optimistic(op, now)?;
            }
        }
        Ok(())
    }

    /// Stores the authoritative remote state of a row; `None` removes it.
    pub fn replace_authoritative(
        &self,
        key: &RecordKey,
        record: Option<&Record>,
        now: u64,
    ) -> SyncResult<()> {
        match record {
            Some(record) => self.write(CacheEntry::from_record(record, now)),
            None => self.remove(key),
        }
    }

    /// Removes a row. Removing an uncached row is a no-op.
    pub fn remove(&self, key: &RecordKey) -> SyncResult<()> {
        if self.get(key).is_none() {
            return Ok(());
        }
        self.store.delete(&entry_key(&key.table, &key.id))?;
        let mut tables = self.tables.write();
        if let Some(rows) = tables.get_mut(&key.table) {
            rows.remove(&key.id);
            if rows.is_empty() {
                tables.remove(&key.table);
            }
        }
        Ok(())
    }

    fn write(&self, entry: CacheEntry) -> SyncResult<()> {
        self.store
            .put(&entry_key(&entry.table, &entry.id), &entry.encode()?)?;
        self.tables
            .write()
            .entry(entry.table.clone())
            .or_default()
            .insert(entry.id.clone(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::OpId;
    use offsync_storage::InMemoryStore;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Deserialize)]
    struct Task {
        id: String,
        completed: bool,
    }

    fn task(id: &str, completed: bool, version: Version) -> Record {
        Record::from_row("tasks", &json!({"id": id, "completed": completed}), version).unwrap()
    }

    fn open_cache() -> (Arc<InMemoryStore>, CacheStore) {
        let store = Arc::new(InMemoryStore::new());
        let cache = CacheStore::open(store.clone()).unwrap();
        (store, cache)
    }

    #[test]
    fn empty_table_reads_empty() {
        let (_, cache) = open_cache();
        assert!(cache.get_records("tasks").is_empty());
        assert!(cache.get_from_cache::<Task>("tasks").is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn put_keeps_higher_version() {
        let (_, cache) = open_cache();
        cache.put("tasks", &[task("1", true, 20)], 0).unwrap();

        assert_eq!(cache.put("tasks", &[task("1", false, 10)], 0).unwrap(), 0);
        assert_eq!(cache.get(&RecordKey::new("tasks", "1")).unwrap().version, 20);

        assert_eq!(cache.put("tasks", &[task("1", false, 30)], 0).unwrap(), 1);
        let rows: Vec<Task> = cache.get_from_cache("tasks");
        assert_eq!(
            rows,
            vec![Task {
                id: "1".into(),
                completed: false
            }]
        );
    }

    #[test]
    fn put_ignores_rows_of_other_tables() {
        let (_, cache) = open_cache();
        let other = Record::from_row("notes", &json!({"id": "n"}), 1).unwrap();
        assert_eq!(cache.put("tasks", &[other], 0).unwrap(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalid_table_names_are_rejected() {
        assert!(validate_table("").is_err());
        assert!(validate_table("a/b").is_err());
        assert!(validate_table("tasks").is_ok());
    }

    #[test]
    fn cache_survives_reopen() {
        let (store, cache) = open_cache();
        cache.put("tasks", &[task("1", true, 5), task("2", false, 6)], 9).unwrap();

        let reopened = CacheStore::open(store).unwrap();
        assert_eq!(reopened.get_records("tasks").len(), 2);
        assert_eq!(reopened.tables(), vec!["tasks"]);
    }

    #[test]
    fn unreadable_entries_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        store.put("cache/tasks/bad", b"not cbor").unwrap();
        let cache = CacheStore::open(store.clone()).unwrap();
        cache.put("tasks", &[task("1", true, 1)], 0).unwrap();

        let cache = CacheStore::open(store).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn write_fails_without_touching_memory() {
        let (store, cache) = open_cache();
        store.set_unavailable(true);

        assert!(cache.put("tasks", &[task("1", true, 1)], 0).is_err());
        assert!(cache.get_records("tasks").is_empty());
    }

    #[test]
    fn optimistic_delete_removes_row() {
        let (_, cache) = open_cache();
        cache.put("tasks", &[task("1", true, 1)], 0).unwrap();

        let op = QueuedOperation::new(OpId(1), OperationKind::Delete, task("1", true, 2), Some(1), 2);
        cache.write_optimistic(&op, 2).unwrap();
        assert!(cache.get(&op.key()).is_none());
    }

    #[test]
    fn overlay_replays_missing_writes() {
        let (_, cache) = open_cache();
        let insert = QueuedOperation::new(OpId(1), OperationKind::Insert, task("1", false, 1), None, 1);
        let update = QueuedOperation::new(OpId(2), OperationKind::Update, task("1", true, 2), Some(1), 2);
        let delete = QueuedOperation::new(OpId(3), OperationKind::Delete, task("2", false, 3), None, 3);
        cache.put("tasks", &[task("2", false, 1)], 0).unwrap();

        cache.overlay(&[insert, update], 5).unwrap();
        cache.overlay(std::slice::from_ref(&delete), 5).unwrap();

        let row = cache.get(&RecordKey::new("tasks", "1")).unwrap();
        assert_eq!(row.field("completed"), Some(&json!(true)));
        assert!(cache.get(&delete.key()).is_none());
    }

    #[test]
    fn replace_authoritative_overrides_version_order() {
        let (_, cache) = open_cache();
        let key = RecordKey::new("tasks", "1");
        cache.put("tasks", &[task("1", false, 50)], 0).unwrap();

        cache.replace_authoritative(&key, Some(&task("1", true, 40)), 1).unwrap();
        assert_eq!(cache.version_of(&key), Some(40));

        cache.replace_authoritative(&key, None, 2).unwrap();
        assert!(cache.get(&key).is_none());
        assert!(cache.tables().is_empty());
    }
}
