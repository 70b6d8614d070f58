//! Queued mutations and their lifecycle.

use crate::codec::{decode, encode};
use crate::error::CodecResult;
use crate::record::{Record, RecordKey, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operation id: a strictly increasing, never reused sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OpId(pub u64);

impl OpId {
    /// Returns the id that follows this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create the row (upsert on the remote).
    Insert,
    /// Change the row (upsert on the remote, base version checked).
    Update,
    /// Remove the row if it exists (base version checked).
    Delete,
}

impl OperationKind {
    /// Returns true for kinds whose base version is checked against the remote.
    pub fn checks_base_version(&self) -> bool {
        matches!(self, OperationKind::Update | OperationKind::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a queued operation.
///
/// ```text
/// Pending -> InFlight -> Applied            (removed from the log)
///                     -> Pending            (network failure, attempt not counted)
///                     -> Failed -> Pending  (rejected, retried after backoff)
///                     -> PermanentlyFailed  (rejected too often, manual action)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be sent.
    Pending,
    /// Sent, no definitive answer yet.
    InFlight,
    /// Rejected by the remote; waiting for its backoff timer.
    Failed,
    /// Rejected too many times; kept until retried or discarded by a user.
    PermanentlyFailed,
    /// Confirmed by the remote.
    Applied,
}

impl OperationStatus {
    /// Returns true if the operation still counts as pending work.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            OperationStatus::Pending | OperationStatus::InFlight | OperationStatus::Failed
        )
    }

    /// Returns true if the operation needs a user decision.
    pub fn is_permanently_failed(&self) -> bool {
        matches!(self, OperationStatus::PermanentlyFailed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in_flight",
            OperationStatus::Failed => "failed",
            OperationStatus::PermanentlyFailed => "permanently_failed",
            OperationStatus::Applied => "applied",
        };
        f.write_str(name)
    }
}

/// A mutation waiting in the mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Log sequence number.
    pub op_id: OpId,
    /// Logical table name.
    pub table: String,
    /// Kind of mutation.
    pub kind: OperationKind,
    /// Snapshot of the row as written locally. For deletes only the key matters.
    pub record: Record,
    /// Version of the row this mutation was made against, if one was known.
    pub base_version: Option<Version>,
    /// Local wall-clock time the mutation was queued (ms since epoch).
    pub enqueued_at: u64,
    /// Number of application-level rejections so far.
    pub attempts: u32,
    /// Current lifecycle state.
    pub status: OperationStatus,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Earliest time a `Failed` operation may be retried (ms since epoch).
    pub next_attempt_at: Option<u64>,
}

impl QueuedOperation {
    /// Creates a new pending operation.
    pub fn new(
        op_id: OpId,
        kind: OperationKind,
        record: Record,
        base_version: Option<Version>,
        enqueued_at: u64,
    ) -> Self {
        Self {
            op_id,
            table: record.table.clone(),
            kind,
            record,
            base_version,
            enqueued_at,
            attempts: 0,
            status: OperationStatus::Pending,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Returns the id of the targeted row.
    pub fn record_id(&self) -> &str {
        &self.record.id
    }

    /// Returns the key of the targeted row.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table.clone(), self.record.id.clone())
    }

    /// Version this mutation writes when it wins.
    pub fn write_version(&self) -> Version {
        self.record.version
    }

    /// Returns true if the operation may be sent at `now`.
    pub fn is_ready(&self, now: u64) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::Failed => self.next_attempt_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        encode(self)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        decode(bytes)
    }
}
