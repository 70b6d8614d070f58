//! Durable mutation log.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use offsync_protocol::{
    decode, encode, OpId, OperationKind, OperationStatus, QueuedOperation, Record, RecordKey,
    SyncStatus, Version,
};
use offsync_storage::PersistentStore;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

const OP_PREFIX: &str = "log/op/";
const NEXT_OP_ID_KEY: &str = "log/next_op_id";

fn op_key(op_id: OpId) -> String {
    format!("{OP_PREFIX}{:020}", op_id.0)
}

#[derive(Default)]
struct LogState {
    ops: BTreeMap<OpId, QueuedOperation>,
    by_record: HashMap<RecordKey, BTreeSet<OpId>>,
    next_op_id: OpId,
    pending: u64,
    failed: u64,
}

impl LogState {
    fn count(&mut self, status: OperationStatus, delta: i64) {
        let bucket = if status.is_pending() {
            &mut self.pending
        } else if status.is_permanently_failed() {
            &mut self.failed
        } else {
            return;
        };
        *bucket = bucket.saturating_add_signed(delta);
    }

    fn insert(&mut self, op: QueuedOperation) {
        self.count(op.status, 1);
        self.by_record.entry(op.key()).or_default().insert(op.op_id);
        self.ops.insert(op.op_id, op);
    }

    fn remove(&mut self, op_id: OpId) -> Option<QueuedOperation> {
        let op = self.ops.remove(&op_id)?;
        self.count(op.status, -1);
        let key = op.key();
        if let Some(ids) = self.by_record.get_mut(&key) {
            ids.remove(&op_id);
            if ids.is_empty() {
                self.by_record.remove(&key);
            }
        }
        Some(op)
    }

    fn replace(&mut self, op: QueuedOperation) {
        if let Some(old) = self.ops.get(&op.op_id) {
            let old_status = old.status;
            self.count(old_status, -1);
        }
        self.count(op.status, 1);
        self.ops.insert(op.op_id, op);
    }

    fn get(&self, op_id: OpId) -> SyncResult<&QueuedOperation> {
        self.ops
            .get(&op_id)
            .ok_or(SyncError::UnknownOperation(op_id))
    }
}

/// Durable, ordered queue of pending writes.
///
/// The log is the single source of truth for what must still be sent. Every
/// transition is written to the store before the in-memory view changes, so
/// a failed write leaves the log exactly as it was.
///
/// # Invariants
///
/// - Operation ids strictly increase and are never reused, across restarts too
/// - Operations on one row are yielded in id order; a row whose oldest
///   operation is not ready blocks its later operations, never other rows
/// - An operation leaves the log only when applied or explicitly discarded
/// - `pending`/`failed` counts are maintained on every transition
pub struct MutationLog {
    store: Arc<dyn PersistentStore>,
    state: Mutex<LogState>,
}

impl MutationLog {
    /// Loads the log from the store.
    ///
    /// Operations that were in flight when the process stopped got no
    /// definitive answer, so they come back as `Pending`.
    pub fn open(store: Arc<dyn PersistentStore>) -> SyncResult<Self> {
        let mut state = LogState {
            next_op_id: OpId(1),
            ..LogState::default()
        };

        if let Some(bytes) = store.get(NEXT_OP_ID_KEY)? {
            state.next_op_id = OpId(decode::<u64>(&bytes)?);
        }

        for (_, bytes) in store.scan_prefix(OP_PREFIX)? {
            let mut op = QueuedOperation::decode(&bytes)?;
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
            }
            if op.op_id >= state.next_op_id {
                state.next_op_id = op.op_id.next();
            }
            state.insert(op);
        }

        tracing::debug!(
            operations = state.ops.len(),
            next_op_id = %state.next_op_id,
            "mutation log loaded"
        );

        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    /// Appends a new pending operation and returns it once it is durable.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        record: Record,
        base_version: Option<Version>,
        now: u64,
    ) -> SyncResult<QueuedOperation> {
        let mut state = self.state.lock();
        let op_id = state.next_op_id;
        let op = QueuedOperation::new(op_id, kind, record, base_version, now);

        self.store.put(&op_key(op_id), &op.encode()?)?;
        self.store.put(NEXT_OP_ID_KEY, &encode(&op_id.next().0)?)?;

        state.next_op_id = op_id.next();
        state.insert(op.clone());

        tracing::debug!(op_id = %op_id, table = %op.table, record_id = %op.record_id(), %kind, "operation queued");
        Ok(op)
    }

    /// Returns the operations of `table` that may be sent at `now`, in id order.
    ///
    /// For each row, only the unbroken run of ready operations starting at its
    /// oldest operation is returned. Rows are independent of each other.
    pub fn dequeue_batch(&self, table: &str, now: u64, limit: usize) -> Vec<QueuedOperation> {
        let state = self.state.lock();
        let mut blocked: HashSet<&str> = HashSet::new();
        let mut batch = Vec::new();

        for op in state.ops.values().filter(|op| op.table == table) {
            if batch.len() >= limit {
                break;
            }
            if blocked.contains(op.record_id()) {
                continue;
            }
            if op.is_ready(now) {
                batch.push(op.clone());
            } else {
                blocked.insert(op.record_id());
            }
        }
        batch
    }

    /// Returns the tables that have at least one operation ready at `now`.
    pub fn tables_with_ready_work(&self, now: u64) -> Vec<String> {
        let state = self.state.lock();
        let tables: BTreeSet<&str> = state
            .ops
            .values()
            .filter(|op| op.is_ready(now))
            .map(|op| op.table.as_str())
            .collect();
        tables.into_iter().map(str::to_string).collect()
    }

    /// Marks an operation as sent.
    ///
    /// Not persisted: after a restart an in-flight operation is pending again.
    pub fn mark_in_flight(&self, op_id: OpId) -> SyncResult<()> {
        let mut state = self.state.lock();
        let mut op = state.get(op_id)?.clone();
        op.status = OperationStatus::InFlight;
        state.replace(op);
        Ok(())
    }

    /// Puts an operation still marked in flight back to `Pending`.
    ///
    /// Used when a cycle ends without recording an answer, such as when the
    /// store refused the status write. Any other status is left alone.
    pub fn release_in_flight(&self, op_id: OpId) {
        let mut state = self.state.lock();
        let Some(current) = state.ops.get(&op_id) else {
            return;
        };
        if current.status != OperationStatus::InFlight {
            return;
        }
        let mut op = current.clone();
        op.status = OperationStatus::Pending;
        state.replace(op);
        tracing::debug!(op_id = %op_id, "in-flight operation released");
    }

    /// Removes a confirmed operation from the log.
    ///
    /// Returns `None` if the operation is no longer in the log (it was
    /// discarded while its call was outstanding); the caller must then ignore
    /// the remote's answer.
    pub fn mark_applied(&self, op_id: OpId) -> SyncResult<Option<QueuedOperation>> {
        let mut state = self.state.lock();
        if !state.ops.contains_key(&op_id) {
            return Ok(None);
        }
        self.store.delete(&op_key(op_id))?;
        Ok(state.remove(op_id).map(|mut op| {
            op.status = OperationStatus::Applied;
            op
        }))
    }

    /// Returns an operation to `Pending` after a network-level failure.
    ///
    /// The attempt budget is not touched.
    pub fn mark_retryable(&self, op_id: OpId, error: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        let Some(current) = state.ops.get(&op_id) else {
            return Ok(());
        };
        let mut op = current.clone();
        op.status = OperationStatus::Pending;
        op.last_error = Some(error.to_string());
        self.store.put(&op_key(op_id), &op.encode()?)?;
        state.replace(op);
        Ok(())
    }

    /// Records an application-level rejection.
    ///
    /// Increments `attempts`; below the ceiling the operation waits for its
    /// backoff as `Failed`, at the ceiling it becomes `PermanentlyFailed`.
    /// Returns the updated operation, or `None` if it was discarded meanwhile.
    pub fn mark_failed(
        &self,
        op_id: OpId,
        error: &str,
        retry: &RetryConfig,
        now: u64,
    ) -> SyncResult<Option<QueuedOperation>> {
        let mut state = self.state.lock();
        let Some(current) = state.ops.get(&op_id) else {
            return Ok(None);
        };
        let mut op = current.clone();
        op.attempts += 1;
        op.last_error = Some(error.to_string());

        if retry.is_exhausted(op.attempts) {
            op.status = OperationStatus::PermanentlyFailed;
            op.next_attempt_at = None;
        } else {
            op.status = OperationStatus::Failed;
            let delay = retry.delay_for_attempt(op.attempts).as_millis() as u64;
            op.next_attempt_at = Some(now.saturating_add(delay));
        }

        self.store.put(&op_key(op_id), &op.encode()?)?;
        state.replace(op.clone());
        Ok(Some(op))
    }

    /// Moves a permanently failed operation back to `Pending` with a fresh budget.
    pub fn retry(&self, op_id: OpId) -> SyncResult<()> {
        let mut state = self.state.lock();
        let op = state.get(op_id)?;
        if !op.status.is_permanently_failed() {
            return Err(SyncError::NotPermanentlyFailed(op_id));
        }
        let mut op = op.clone();
        op.status = OperationStatus::Pending;
        op.attempts = 0;
        op.next_attempt_at = None;
        self.store.put(&op_key(op_id), &op.encode()?)?;
        state.replace(op);
        Ok(())
    }

    /// Retries every permanently failed operation. Returns how many were reset.
    pub fn retry_all_failed(&self) -> SyncResult<usize> {
        let ids = self.failed_ids();
        for op_id in &ids {
            self.retry(*op_id)?;
        }
        Ok(ids.len())
    }

    /// Removes a permanently failed operation without sending it.
    pub fn discard(&self, op_id: OpId) -> SyncResult<QueuedOperation> {
        let mut state = self.state.lock();
        if !state.get(op_id)?.status.is_permanently_failed() {
            return Err(SyncError::NotPermanentlyFailed(op_id));
        }
        self.store.delete(&op_key(op_id))?;
        state.remove(op_id).ok_or(SyncError::UnknownOperation(op_id))
    }

    /// Current `pending`/`failed` counts. O(1).
    pub fn counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.pending, state.failed)
    }

    /// Status view of the log with the given last sync time.
    pub fn status(&self, last_sync: Option<u64>) -> SyncStatus {
        let (pending, failed) = self.counts();
        SyncStatus {
            pending,
            failed,
            last_sync,
        }
    }

    /// Returns an operation by id.
    pub fn get(&self, op_id: OpId) -> Option<QueuedOperation> {
        self.state.lock().ops.get(&op_id).cloned()
    }

    /// Returns every operation in id order.
    pub fn operations(&self) -> Vec<QueuedOperation> {
        self.state.lock().ops.values().cloned().collect()
    }

    /// Returns every permanently failed operation in id order.
    pub fn failed_operations(&self) -> Vec<QueuedOperation> {
        self.state
            .lock()
            .ops
            .values()
            .filter(|op| op.status.is_permanently_failed())
            .cloned()
            .collect()
    }

    /// Returns true if any operation for the row is still in the log.
    pub fn has_unapplied_for(&self, key: &RecordKey) -> bool {
        self.state.lock().by_record.contains_key(key)
    }

    /// Returns the newest operation queued for the row.
    pub fn latest_for(&self, key: &RecordKey) -> Option<QueuedOperation> {
        let state = self.state.lock();
        let op_id = state.by_record.get(key)?.iter().next_back()?;
        state.ops.get(op_id).cloned()
    }

    /// Earliest backoff deadline among `Failed` operations.
    pub fn next_attempt_at(&self) -> Option<u64> {
        self.state
            .lock()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Failed)
            .filter_map(|op| op.next_attempt_at)
            .min()
    }

    /// Number of operations in the log.
    pub fn len(&self) -> usize {
        self.state.lock().ops.len()
    }

    /// Returns true if the log holds no operations.
    pub fn is_empty(&self) -> bool {
        self.state.lock().ops.is_empty()
    }

    fn failed_ids(&self) -> Vec<OpId> {
        self.state
            .lock()
            .ops
            .values()
            .filter(|op| op.status.is_permanently_failed())
            .map(|op| op.op_id)
            .collect()
    }
}
