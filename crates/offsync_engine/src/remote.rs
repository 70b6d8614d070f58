//! Remote store abstraction and the adapter that applies queued operations.

use async_trait::async_trait;
use offsync_protocol::{
    Conflict, ConflictPolicy, ConflictResolution, Filter, OpId, OperationKind, QueuedOperation,
    Record, RecordKey, Version,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failure of a single remote call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The remote could not be reached (DNS, connection reset, offline).
    #[error("network error: {0}")]
    Network(String),

    /// The call did not complete within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The remote refused the write (validation, permission).
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// The row's current version differs from the operation's base version.
    #[error("version conflict")]
    Conflict {
        /// Current remote row, `None` if it does not exist.
        current: Option<Record>,
    },
}

/// How a remote failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried on the next connectivity window without consuming an attempt.
    TransientNetwork,
    /// Consumes an attempt; may end in `PermanentlyFailed`.
    Application,
    /// Resolved by the conflict policy.
    Conflict,
}

impl RemoteError {
    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => ErrorClass::TransientNetwork,
            RemoteError::Rejected(_) => ErrorClass::Application,
            RemoteError::Conflict { .. } => ErrorClass::Conflict,
        }
    }

    /// Returns true if the error does not consume the attempt budget.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::TransientNetwork
    }
}

/// The authoritative remote store.
///
/// Writes must be upserts keyed by `(table, id)` and deletes must be
/// delete-if-exists, so that redelivering an operation has no further effect.
/// When a base version is given, the remote compares it with the row's
/// current version and answers [`RemoteError::Conflict`] on mismatch; `None`
/// writes unconditionally. An insert answers [`RemoteError::Conflict`] when
/// the row already exists at the record's version or a newer one. The idempotency token may be used to deduplicate
/// redeliveries; remotes that cannot do so may ignore it.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the rows of `table` selected by `filter`.
    async fn fetch(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Record>>;

    /// Upserts a new row unless the remote already holds the same or a newer
    /// version of it, and returns it as committed.
    async fn insert(&self, record: &Record, token: &str) -> RemoteResult<Record>;

    /// Upserts a changed row and returns it as committed.
    async fn update(
        &self,
        record: &Record,
        base_version: Option<Version>,
        token: &str,
    ) -> RemoteResult<Record>;

    /// Deletes a row if it exists.
    async fn delete(
        &self,
        key: &RecordKey,
        base_version: Option<Version>,
        token: &str,
    ) -> RemoteResult<()>;
}

/// Definitive result of applying one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    /// Remote state of the row afterwards; `None` if the row does not exist.
    pub committed: Option<Record>,
    /// The conflict that was resolved on the way, if any.
    pub conflict: Option<Conflict>,
}

/// Applies queued operations to a [`RemoteStore`].
///
/// Adds the per-call timeout, the idempotency token and conflict resolution.
/// A conflict is always resolved here: either the remote row is accepted and
/// the operation counts as applied, or the local write is re-issued without a
/// base version.
pub struct RemoteAdapter<R: RemoteStore> {
    remote: Arc<R>,
    client_id: Uuid,
    timeout: Duration,
    policy: ConflictPolicy,
}

impl<R: RemoteStore> RemoteAdapter<R> {
    /// Creates a new adapter.
    pub fn new(remote: Arc<R>, client_id: Uuid, timeout: Duration, policy: ConflictPolicy) -> Self {
        Self {
            remote,
            client_id,
            timeout,
            policy,
        }
    }

    /// Returns the wrapped remote.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Returns the conflict policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Token identifying one operation of this client across redeliveries.
    pub fn idempotency_token(&self, op_id: OpId) -> String {
        format!("{}:{}", self.client_id, op_id)
    }

    /// Fetches rows, bounded by the request timeout.
    pub async fn fetch(&self, table: &str, filter: &Filter) -> RemoteResult<Vec<Record>> {
        self.bounded(self.remote.fetch(table, filter)).await
    }

    /// Applies an operation.
    ///
    /// `Err` means no definitive answer (network, timeout) or a rejection;
    /// the caller decides what that does to the operation.
    pub async fn apply(&self, op: &QueuedOperation) -> RemoteResult<ApplyOutcome> {
        let token = self.idempotency_token(op.op_id);
        match self.send(op, true, &token).await {
            Ok(committed) => Ok(ApplyOutcome {
                committed,
                conflict: None,
            }),
            Err(RemoteError::Conflict { current }) => self.resolve(op, current, &token).await,
            Err(e) => Err(e),
        }
    }

    async fn resolve(
        &self,
        op: &QueuedOperation,
        current: Option<Record>,
        token: &str,
    ) -> RemoteResult<ApplyOutcome> {
        // A redelivery whose first delivery landed: the row already holds this write.
        if let Some(row) = &current {
            if op.kind != OperationKind::Delete
                && row.version == op.write_version()
                && row.payload == op.record.payload
            {
                return Ok(ApplyOutcome {
                    committed: current,
                    conflict: None,
                });
            }
        }

        let remote_version = current.as_ref().map(|row| row.version);
        let resolution = self.policy.resolve(op.write_version(), remote_version);
        let conflict = Conflict {
            op_id: op.op_id,
            kind: op.kind,
            key: op.key(),
            base_version: op.base_version,
            local_version: op.write_version(),
            remote_version,
            resolution,
        };

        match resolution {
            ConflictResolution::AcceptRemote => Ok(ApplyOutcome {
                committed: current,
                conflict: Some(conflict),
            }),
            ConflictResolution::KeepLocal => {
                let committed = self.send(op, false, token).await?;
                Ok(ApplyOutcome {
                    committed,
                    conflict: Some(conflict),
                })
            }
        }
    }

    /// Sends the operation. Unless `checked`, the write is unconditional.
    async fn send(
        &self,
        op: &QueuedOperation,
        checked: bool,
        token: &str,
    ) -> RemoteResult<Option<Record>> {
        let base_version = if checked { op.base_version } else { None };
        match op.kind {
            OperationKind::Insert if checked => {
                self.bounded(self.remote.insert(&op.record, token)).await.map(Some)
            }
            OperationKind::Insert | OperationKind::Update => self
                .bounded(self.remote.update(&op.record, base_version, token))
                .await
                .map(Some),
            OperationKind::Delete => self
                .bounded(self.remote.delete(&op.key(), base_version, token))
                .await
                .map(|()| None),
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| RemoteError::Timeout)?
    }
}
