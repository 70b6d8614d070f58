//! CLI command implementations.

pub mod cache;
pub mod compact;
pub mod discard;
pub mod queue;
pub mod retry;
pub mod status;

use offsync_engine::{CacheStore, MutationLog, SyncError};
use offsync_storage::{FileStore, StorageError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Error, Debug)]
pub enum CliError {
    /// No store file at the given path.
    #[error("no store found at {0:?}")]
    NotFound(PathBuf),

    /// The store file could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The log or cache rejected the request.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Output could not be serialized.
    #[error("json output failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// A store file opened with its log and cache.
pub struct OpenStore {
    /// The store file.
    pub file: Arc<FileStore>,
    /// Mutation log kept in the file.
    pub log: MutationLog,
    /// Cache kept in the file.
    pub cache: CacheStore,
}

/// Opens an existing store file.
pub fn open(path: &Path) -> CliResult<OpenStore> {
    if !path.exists() {
        return Err(CliError::NotFound(path.to_path_buf()));
    }
    let file = Arc::new(FileStore::open(path)?);
    let log = MutationLog::open(file.clone())?;
    let cache = CacheStore::open(file.clone())?;
    tracing::debug!(path = %path.display(), operations = log.len(), rows = cache.len(), "store opened");
    Ok(OpenStore { file, log, cache })
}

/// Formats a millisecond timestamp for text output.
pub fn format_millis(millis: u64) -> String {
    let secs = millis / 1_000;
    format!("{secs}.{:03}s", millis % 1_000)
}

/// Formats a byte count for text output.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
