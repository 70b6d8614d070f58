//! Error types for the sync engine.

use offsync_protocol::{CodecError, OpId};
use offsync_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by the engine's public operations.
///
/// Remote failures never surface here; they are absorbed by the mutation log
/// and show up in [`crate::SyncManager::get_sync_status`].
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local durable storage failed (quota, corruption, I/O).
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// A persisted value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The row or table passed by the caller is unusable.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// No operation with this id is in the log.
    #[error("unknown operation {0}")]
    UnknownOperation(OpId),

    /// The operation is not permanently failed, so it cannot be retried or discarded.
    #[error("operation {0} is not permanently failed")]
    NotPermanentlyFailed(OpId),

    /// The remote store refused or could not serve a read.
    #[error("remote error: {0}")]
    Remote(#[from] crate::remote::RemoteError),

    /// The manager was disposed.
    #[error("sync manager disposed")]
    Disposed,
}

impl SyncError {
    /// Creates an invalid-record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }

    /// Returns true if this error means local storage is unusable.
    pub fn is_persistence(&self) -> bool {
        matches!(self, SyncError::Persistence(_) | SyncError::Codec(_))
    }
}
