//! Observable engine events.

use offsync_protocol::{Conflict, OpId, OperationKind, RecordKey};

/// Something the engine did that observers may care about.
///
/// Events are delivered over a broadcast channel; slow subscribers miss
/// events rather than slowing the engine down.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// An operation was durably queued.
    Queued {
        /// Operation id.
        op_id: OpId,
        /// Kind of the operation.
        kind: OperationKind,
        /// Targeted row.
        key: RecordKey,
    },
    /// The remote confirmed an operation.
    Applied {
        /// Operation id.
        op_id: OpId,
        /// Targeted row.
        key: RecordKey,
    },
    /// A base-version conflict was detected and resolved.
    Conflict(Conflict),
    /// A network-level failure left the operation pending.
    Deferred {
        /// Operation id.
        op_id: OpId,
        /// Targeted row.
        key: RecordKey,
        /// Failure message.
        error: String,
    },
    /// The remote rejected an operation; it will be retried after a backoff.
    Rejected {
        /// Operation id.
        op_id: OpId,
        /// Targeted row.
        key: RecordKey,
        /// Rejections so far.
        attempts: u32,
        /// Earliest retry time (ms since epoch).
        retry_at: u64,
        /// Rejection message.
        error: String,
    },
    /// An operation exhausted its attempts and now needs a user decision.
    PermanentlyFailed {
        /// Operation id.
        op_id: OpId,
        /// Targeted row.
        key: RecordKey,
        /// Last rejection message.
        error: String,
    },
    /// A flush cycle finished.
    CycleCompleted {
        /// Operations confirmed during the cycle.
        applied: usize,
        /// Operations left pending by network failures.
        deferred: usize,
        /// Operations rejected by the remote.
        rejected: usize,
    },
    /// Connectivity changed.
    ConnectivityChanged {
        /// New state.
        online: bool,
    },
}
