//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store file is corrupted.
    #[error("storage corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Byte offset of the bad frame.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// Another handle, usually another process, has the store open.
    #[error("store {0:?} is locked by another handle")]
    Locked(PathBuf),

    /// The store refuses writes (quota exhausted, read-only medium, injected fault).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }
}
