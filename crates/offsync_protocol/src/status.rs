//! Derived sync status for UI consumption.

use serde::{Deserialize, Serialize};

/// Snapshot of the mutation log's health.
///
/// This is a derived view and is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Operations that will still be sent automatically.
    pub pending: u64,
    /// Operations that need a user decision.
    pub failed: u64,
    /// Completion time of the last flush cycle that finished cleanly (ms since epoch).
    pub last_sync: Option<u64>,
}

impl SyncStatus {
    /// Derives the indicator a status widget shows.
    ///
    /// Priority: offline, then failures, then pending work, then synced.
    pub fn indicator(&self, online: bool) -> SyncIndicator {
        if !online {
            SyncIndicator::Offline
        } else if self.failed > 0 {
            SyncIndicator::Failed(self.failed)
        } else if self.pending > 0 {
            SyncIndicator::Pending(self.pending)
        } else {
            SyncIndicator::Synced
        }
    }
}

/// What a status widget should display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncIndicator {
    /// No connectivity.
    Offline,
    /// Some operations need a user decision.
    Failed(u64),
    /// Operations are waiting to be sent.
    Pending(u64),
    /// Everything is confirmed.
    Synced,
}
