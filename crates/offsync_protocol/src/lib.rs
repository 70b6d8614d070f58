//! # offsync protocol
//!
//! Data model shared by the offsync engine, its stores and its tools.
//!
//! This crate provides:
//! - [`Record`] and [`Filter`] for rows of logical tables
//! - [`QueuedOperation`] and its lifecycle ([`OperationStatus`])
//! - [`CacheEntry`] for the local cache
//! - [`SyncStatus`] and the UI-facing [`SyncIndicator`]
//! - [`Conflict`] and [`ConflictPolicy`]
//! - CBOR encoding/decoding for everything that is persisted
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod codec;
mod conflict;
mod error;
mod operation;
mod record;
mod status;

pub use cache::CacheEntry;
pub use codec::{decode, encode};
pub use conflict::{Conflict, ConflictPolicy, ConflictResolution};
pub use error::{CodecError, CodecResult};
pub use operation::{OpId, OperationKind, OperationStatus, QueuedOperation};
pub use record::{Filter, Payload, Record, RecordKey, Version};
pub use status::{SyncIndicator, SyncStatus};
