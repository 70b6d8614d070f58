//! In-memory key-value store for testing.

use crate::error::{StorageError, StorageResult};
use crate::store::PersistentStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An in-memory key-value store.
///
/// This store keeps everything in a sorted map and is suitable for:
/// - Unit tests
/// - Integration tests (share it behind an `Arc` to simulate a restart)
/// - Ephemeral engines that don't need persistence
///
/// Writes can be switched off with [`InMemoryStore::set_unavailable`] to
/// exercise the persistence-failure path.
///
/// # Example
///
/// ```rust
/// use offsync_storage::{InMemoryStore, PersistentStore};
///
/// let store = InMemoryStore::new();
/// store.put("a", b"1").unwrap();
/// store.set_unavailable(true);
/// assert!(store.put("b", b"2").is_err());
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with pre-existing entries.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
            ..Self::default()
        }
    }

    /// Makes every subsequent write fail with [`StorageError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns a copy of all entries.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.entries.read().clone()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Returns how many successful writes (puts and deletes) the store has seen.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("in-memory store disabled".into()));
        }
        Ok(())
    }
}

impl PersistentStore for InMemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        self.entries.write().insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.check_writable()?;
        self.entries.write().remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn flush(&self) -> StorageResult<()> {
        // Nothing is buffered
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn memory_put_overwrites() {
        let store = InMemoryStore::new();
        store.put("k", b"one").unwrap();
        store.put("k", b"two").unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn memory_delete_missing_is_ok() {
        let store = InMemoryStore::new();
        store.delete("nope").unwrap();
        store.put("k", b"v").unwrap();
        store.delete("k").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn memory_scan_prefix_is_sorted_and_bounded() {
        let store = InMemoryStore::new();
        store.put("log/op/00000000000000000002", b"b").unwrap();
        store.put("cache/tasks/1", b"x").unwrap();
        store.put("log/op/00000000000000000001", b"a").unwrap();
        store.put("log/meta", b"m").unwrap();

        let ops = store.scan_prefix("log/op/").unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].1, b"a");
        assert_eq!(ops[1].1, b"b");
    }

    #[test]
    fn memory_unavailable_rejects_writes_but_serves_reads() {
        let store = InMemoryStore::with_entries([("k", b"v".to_vec())]);
        store.set_unavailable(true);

        assert!(matches!(
            store.put("k2", b"v2"),
            Err(StorageError::Unavailable(_))
        ));
        assert!(matches!(store.delete("k"), Err(StorageError::Unavailable(_))));
        assert_eq!(store.get("k").unwrap(), Some(b"v".to_vec()));

        store.set_unavailable(false);
        store.put("k2", b"v2").unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn memory_flush_succeeds() {
        let store = InMemoryStore::new();
        assert!(store.flush().is_ok());
    }
}
