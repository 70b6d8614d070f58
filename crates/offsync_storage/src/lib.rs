//! # offsync storage
//!
//! Durable key-value storage for the offsync engine.
//!
//! The engine keeps its mutation log and local cache in a [`PersistentStore`].
//! Stores are **opaque byte maps**: they know nothing about operations,
//! records or tables, only string keys and byte values.
//!
//! ## Design Principles
//!
//! - A successful `put`/`delete` is durable before it returns
//! - Stores must be `Send + Sync`; callers share them behind an `Arc`
//! - Key ordering is lexicographic so prefix scans come back sorted
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral engines
//! - [`FileStore`] - Append-only, checksummed log file with compaction
//!
//! ## Example
//!
//! ```rust
//! use offsync_storage::{InMemoryStore, PersistentStore};
//!
//! let store = InMemoryStore::new();
//! store.put("log/op/1", b"pending").unwrap();
//! assert_eq!(store.get("log/op/1").unwrap(), Some(b"pending".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checksum;
mod error;
mod file;
mod memory;
mod store;

pub use checksum::compute_crc32;
pub use error::{StorageError, StorageResult};
pub use file::{FileStore, FileStoreOptions, FileStoreStats};
pub use memory::InMemoryStore;
pub use store::PersistentStore;
