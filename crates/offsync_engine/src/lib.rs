//! # offsync engine
//!
//! Offline-first sync engine: writes are queued durably, reads are served
//! from a local cache, and a background scheduler drains the queue to a
//! remote store whenever connectivity allows.
//!
//! This crate provides:
//! - Mutation log (durable, ordered per row, with retry bookkeeping)
//! - Local cache store with optimistic writes
//! - Remote adapter (timeouts, idempotency tokens, conflict resolution)
//! - Sync scheduler (connectivity, periodic tick, backoff timers, forced syncs)
//! - [`SyncManager`], the application-facing facade
//!
//! ## Architecture
//!
//! ```text
//!  application ──► SyncManager ──► SyncEngine ──► RemoteAdapter ──► RemoteStore
//!                       │              │
//!                   scheduler      MutationLog + CacheStore
//!                                      │
//!                                PersistentStore
//! ```
//!
//! ## Key Invariants
//!
//! - `queue_operation` returns only after the operation is durable
//! - Operations on one row reach the remote in the order they were queued
//! - Network failures never consume retry attempts
//! - Permanently failed operations stay until retried or discarded
//! - At most one flush cycle runs at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod clock;
mod config;
mod connectivity;
mod engine;
mod error;
mod events;
mod log;
mod manager;
mod memory_remote;
mod remote;
mod scheduler;

pub use cache::{validate_table, CacheStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SyncConfig};
pub use connectivity::{ConnectivityObserver, ManualConnectivity};
pub use engine::{SyncCycleResult, SyncEngine, SyncState, SyncStats};
pub use error::{SyncError, SyncResult};
pub use events::SyncEvent;
pub use log::MutationLog;
pub use manager::SyncManager;
pub use memory_remote::MemoryRemote;
pub use remote::{ApplyOutcome, ErrorClass, RemoteAdapter, RemoteError, RemoteResult, RemoteStore};
