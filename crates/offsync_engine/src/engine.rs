//! Sync engine: queueing, cache reads and flush cycles.

use crate::cache::{validate_table, CacheStore};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::connectivity::{wait_offline, ConnectivityObserver};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::log::MutationLog;
use crate::remote::{ErrorClass, RemoteAdapter, RemoteError, RemoteStore};
use offsync_protocol::{
    CodecError, Conflict, Filter, OpId, OperationKind, QueuedOperation, Record, RecordKey,
    SyncIndicator, SyncStatus,
};
use offsync_storage::PersistentStore;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No flush is running and nothing waits for a backoff timer.
    Idle,
    /// A flush cycle is running.
    Flushing,
    /// No flush is running; rejected operations wait for their backoff timer.
    BackoffWait,
}

impl SyncState {
    /// Returns true if a flush cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Flushing)
    }
}

/// Statistics about sync operations since the engine was opened.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of flush cycles completed.
    pub cycles_completed: u64,
    /// Total number of operations confirmed by the remote.
    pub operations_applied: u64,
    /// Total number of conflicts resolved.
    pub conflicts_resolved: u64,
    /// Total number of operations left pending by network failures.
    pub deferrals: u64,
    /// Total number of application-level rejections.
    pub rejections: u64,
    /// Total number of operations that became permanently failed.
    pub permanent_failures: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a flush cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Operations confirmed by the remote.
    pub applied: usize,
    /// Conflicts resolved during the cycle.
    pub conflicts: Vec<Conflict>,
    /// Operations left pending by network failures.
    pub deferred: usize,
    /// Operations rejected by the remote.
    pub rejected: usize,
    /// Operations that became permanently failed.
    pub permanently_failed: usize,
    /// Whether connectivity dropped before the cycle finished.
    pub interrupted: bool,
    /// Duration of the cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    /// Returns true if every operation attempted got a definitive answer.
    pub fn is_clean(&self) -> bool {
        !self.interrupted && self.deferred == 0
    }

    fn merge(&mut self, other: SyncCycleResult) {
        self.applied += other.applied;
        self.conflicts.extend(other.conflicts);
        self.deferred += other.deferred;
        self.rejected += other.rejected;
        self.permanently_failed += other.permanently_failed;
        self.interrupted |= other.interrupted;
    }
}

/// Releases the flush guard on every exit path.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Releases an operation left in flight when `process` exits early.
struct InFlightGuard<'a> {
    log: &'a MutationLog,
    op_id: OpId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.log.release_in_flight(self.op_id);
    }
}

enum Step {
    Applied,
    Deferred,
    Rejected,
    Interrupted,
}

/// The sync engine.
///
/// Owns the mutation log, the local cache and the remote adapter, and runs
/// flush cycles. At most one cycle runs at a time; within a cycle each table
/// is drained by its own sub-flush, and the sub-flushes run concurrently.
/// Operations on one row are always sent one after another in id order.
///
/// The engine does not schedule itself; see [`crate::SyncManager`].
pub struct SyncEngine<R: RemoteStore> {
    config: SyncConfig,
    store: Arc<dyn PersistentStore>,
    log: MutationLog,
    cache: CacheStore,
    adapter: RemoteAdapter<R>,
    connectivity: Arc<dyn ConnectivityObserver>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SyncEvent>,
    stats: RwLock<SyncStats>,
    last_sync: RwLock<Option<u64>>,
    flushing: AtomicBool,
    wake: Notify,
}

impl<R: RemoteStore> SyncEngine<R> {
    /// Opens the engine over a store.
    ///
    /// Loads the mutation log and the cache, then replays queued operations
    /// over the cache so optimistic state matches the log.
    pub fn open(
        config: SyncConfig,
        store: Arc<dyn PersistentStore>,
        remote: Arc<R>,
        connectivity: Arc<dyn ConnectivityObserver>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let log = MutationLog::open(store.clone())?;
        let cache = CacheStore::open(store.clone())?;
        cache.overlay(&log.operations(), clock.now_millis())?;

        let adapter = RemoteAdapter::new(
            remote,
            config.client_id,
            config.request_timeout,
            config.conflict_policy,
        );
        let (events, _) = broadcast::channel(config.event_capacity);
        let (pending, failed) = log.counts();

        tracing::info!(
            client_id = %config.client_id,
            pending,
            failed,
            cached_rows = cache.len(),
            "sync engine opened"
        );

        Ok(Self {
            config,
            store,
            log,
            cache,
            adapter,
            connectivity,
            clock,
            events,
            stats: RwLock::new(SyncStats::default()),
            last_sync: RwLock::new(None),
            flushing: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the mutation log.
    pub fn log(&self) -> &MutationLog {
        &self.log
    }

    /// Returns the cache.
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Returns the remote adapter.
    pub fn adapter(&self) -> &RemoteAdapter<R> {
        &self.adapter
    }

    /// Returns the connectivity observer.
    pub fn connectivity(&self) -> &Arc<dyn ConnectivityObserver> {
        &self.connectivity
    }

    /// Returns true if the host is online.
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Queues a mutation and applies it to the cache optimistically.
    ///
    /// Returns once the operation is durable. Fails only if the row is
    /// unusable or local storage cannot take the write; remote problems are
    /// never reported here.
    pub fn queue_operation<T: Serialize + ?Sized>(
        &self,
        kind: OperationKind,
        table: &str,
        row: &T,
    ) -> SyncResult<OpId> {
        validate_table(table)?;
        let mut record = Record::from_row(table, row, 0).map_err(|e| match e {
            CodecError::InvalidRecord(message) => SyncError::InvalidRecord(message),
            other => SyncError::Codec(other),
        })?;

        let key = record.key();
        let now = self.clock.now_millis();
        let base_version = self.cache.version_of(&key);
        let floor = [
            base_version,
            self.log.latest_for(&key).map(|op| op.write_version()),
        ]
        .into_iter()
        .flatten()
        .max()
        .map_or(0, |v| v.saturating_add(1));
        record.version = now.max(floor);

        let op = self.log.enqueue(kind, record, base_version, now)?;

        if let Err(e) = self.cache.write_optimistic(&op, now) {
            // The log has it; the overlay on next open puts the cache back in line.
            tracing::warn!(op_id = %op.op_id, key = %key, error = %e, "optimistic cache write failed");
        }

        self.emit(SyncEvent::Queued {
            op_id: op.op_id,
            kind,
            key,
        });
        if self.is_online() {
            self.wake.notify_one();
        }
        Ok(op.op_id)
    }

    /// Returns the cached rows of `table` as `T`. Never blocks on the network.
    pub fn get_from_cache<T: DeserializeOwned>(&self, table: &str) -> Vec<T> {
        self.cache.get_from_cache(table)
    }

    /// Returns the cached rows of `table`.
    pub fn get_records(&self, table: &str) -> Vec<Record> {
        self.cache.get_records(table)
    }

    /// Returns the sync status. O(1).
    pub fn get_sync_status(&self) -> SyncStatus {
        self.log.status(*self.last_sync.read())
    }

    /// Returns what a status widget should show.
    pub fn sync_indicator(&self) -> SyncIndicator {
        self.get_sync_status().indicator(self.is_online())
    }

    /// Returns the current state.
    pub fn state(&self) -> SyncState {
        if self.flushing.load(Ordering::Acquire) {
            SyncState::Flushing
        } else if self.log.next_attempt_at().is_some() {
            SyncState::BackoffWait
        } else {
            SyncState::Idle
        }
    }

    /// Returns a copy of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns the permanently failed operations.
    pub fn failed_operations(&self) -> Vec<QueuedOperation> {
        self.log.failed_operations()
    }

    /// Returns every operation still in the log.
    pub fn pending_operations(&self) -> Vec<QueuedOperation> {
        self.log.operations()
    }

    /// Moves every permanently failed operation back to pending.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        let count = self.log.retry_all_failed()?;
        if count > 0 {
            tracing::info!(count, "retrying failed operations");
            self.wake.notify_one();
        }
        Ok(count)
    }

    /// Moves one permanently failed operation back to pending.
    pub fn retry_operation(&self, op_id: OpId) -> SyncResult<()> {
        self.log.retry(op_id)?;
        tracing::info!(op_id = %op_id, "retrying failed operation");
        self.wake.notify_one();
        Ok(())
    }

    /// Drops a permanently failed operation without sending it.
    ///
    /// If nothing else is queued for the row, its optimistic cache entry is
    /// removed too; the next refresh brings back the remote state.
    pub fn discard_operation(&self, op_id: OpId) -> SyncResult<()> {
        let op = self.log.discard(op_id)?;
        let key = op.key();
        tracing::info!(op_id = %op_id, key = %key, "discarded failed operation");
        if !self.log.has_unapplied_for(&key) {
            self.cache.remove(&key)?;
        }
        Ok(())
    }

    /// Drops every permanently failed operation.
    pub fn discard_failed(&self) -> SyncResult<usize> {
        let failed = self.log.failed_operations();
        for op in &failed {
            self.discard_operation(op.op_id)?;
        }
        Ok(failed.len())
    }

    /// Time until the earliest rejected operation may be retried.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        let at = self.log.next_attempt_at()?;
        Some(Duration::from_millis(at.saturating_sub(self.clock.now_millis())))
    }

    /// Fetches rows from the remote and merges them into the cache.
    ///
    /// Rows with queued operations keep their optimistic state. For
    /// [`Filter::All`] and [`Filter::Ids`], cached rows the remote no longer
    /// has are removed. Returns how many rows were written.
    pub async fn refresh(&self, table: &str, filter: &Filter) -> SyncResult<usize> {
        validate_table(table)?;
        let rows = self.adapter.fetch(table, filter).await?;
        let now = self.clock.now_millis();

        let fetched: HashSet<&str> = rows.iter().map(|row| row.id.as_str()).collect();
        let stale: Vec<RecordKey> = match filter {
            Filter::All => self
                .cache
                .get_records(table)
                .into_iter()
                .map(|row| row.key())
                .filter(|key| !fetched.contains(key.id.as_str()))
                .collect(),
            Filter::Ids(ids) => ids
                .iter()
                .filter(|id| !fetched.contains(id.as_str()))
                .map(|id| RecordKey::new(table, id.clone()))
                .collect(),
            _ => Vec::new(),
        };
        for key in stale.iter().filter(|key| !self.log.has_unapplied_for(key)) {
            self.cache.remove(key)?;
        }

        let authoritative: Vec<Record> = rows
            .iter()
            .filter(|row| !self.log.has_unapplied_for(&row.key()))
            .cloned()
            .collect();
        let written = self.cache.put(table, &authoritative, now)?;

        tracing::debug!(table, fetched = rows.len(), written, "cache refreshed");
        Ok(written)
    }

    /// Returns true if a flush cycle is running.
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Runs one flush cycle.
    ///
    /// Returns `Ok(None)` without doing anything if a cycle is already
    /// running or the host is offline. Remote failures are recorded on the
    /// operations; only local storage failures make this return `Err`.
    pub async fn flush(&self) -> SyncResult<Option<SyncCycleResult>> {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            tracing::debug!("flush already running");
            return Ok(None);
        };
        if !self.is_online() {
            tracing::debug!("offline, flush skipped");
            return Ok(None);
        }

        let start = Instant::now();
        let tables = self.log.tables_with_ready_work(self.clock.now_millis());
        if !tables.is_empty() {
            tracing::info!(tables = tables.len(), "flush cycle started");
        }

        let results = futures::future::join_all(tables.iter().map(|t| self.flush_table(t))).await;

        let mut cycle = SyncCycleResult::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(partial) => cycle.merge(partial),
                Err(e) => {
                    tracing::error!(error = %e, "flush aborted by a local storage failure");
                    first_error.get_or_insert(e);
                }
            }
        }
        cycle.duration = start.elapsed();

        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            if let Some(e) = &first_error {
                stats.last_error = Some(e.to_string());
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if cycle.is_clean() {
            *self.last_sync.write() = Some(self.clock.now_millis());
        }
        if !tables.is_empty() {
            tracing::info!(
                applied = cycle.applied,
                conflicts = cycle.conflicts.len(),
                deferred = cycle.deferred,
                rejected = cycle.rejected,
                interrupted = cycle.interrupted,
                "flush cycle finished"
            );
        }
        self.emit(SyncEvent::CycleCompleted {
            applied: cycle.applied,
            deferred: cycle.deferred,
            rejected: cycle.rejected,
        });
        Ok(Some(cycle))
    }

    /// Drains the ready operations of one table.
    async fn flush_table(&self, table: &str) -> SyncResult<SyncCycleResult> {
        let mut result = SyncCycleResult::default();
        let mut attempted: HashSet<OpId> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut connectivity = self.connectivity.subscribe();

        loop {
            let limit = self.config.batch_size.saturating_add(attempted.len());
            let batch: Vec<QueuedOperation> = self
                .log
                .dequeue_batch(table, self.clock.now_millis(), limit)
                .into_iter()
                .filter(|op| !attempted.contains(&op.op_id))
                .collect();
            if batch.is_empty() {
                return Ok(result);
            }

            let mut progressed = false;
            for op in batch {
                if blocked.contains(op.record_id()) {
                    continue;
                }
                if !self.is_online() {
                    result.interrupted = true;
                    return Ok(result);
                }
                attempted.insert(op.op_id);
                progressed = true;

                match self.process(&op, &mut connectivity, &mut result).await? {
                    Step::Applied => {}
                    Step::Deferred | Step::Rejected => {
                        blocked.insert(op.record_id().to_string());
                    }
                    Step::Interrupted => {
                        result.interrupted = true;
                        return Ok(result);
                    }
                }
            }
            if !progressed {
                return Ok(result);
            }
        }
    }

    /// Sends one operation and records the answer.
    async fn process(
        &self,
        op: &QueuedOperation,
        connectivity: &mut tokio::sync::watch::Receiver<bool>,
        result: &mut SyncCycleResult,
    ) -> SyncResult<Step> {
        let key = op.key();
        self.log.mark_in_flight(op.op_id)?;
        let _in_flight = InFlightGuard {
            log: &self.log,
            op_id: op.op_id,
        };
        tracing::debug!(op_id = %op.op_id, key = %key, kind = %op.kind, "sending operation");

        let answer = tokio::select! {
            answer = self.adapter.apply(op) => Some(answer),
            _ = wait_offline(connectivity) => None,
        };

        let Some(answer) = answer else {
            // Abandoned; a late answer is re-validated on redelivery.
            self.log.mark_retryable(op.op_id, "connectivity lost")?;
            tracing::debug!(op_id = %op.op_id, key = %key, "operation abandoned, connectivity lost");
            return Ok(Step::Interrupted);
        };

        match answer {
            Ok(outcome) => {
                if let Some(conflict) = outcome.conflict {
                    tracing::warn!(
                        op_id = %op.op_id,
                        key = %key,
                        resolution = ?conflict.resolution,
                        local_version = conflict.local_version,
                        remote_version = ?conflict.remote_version,
                        "conflict resolved"
                    );
                    self.stats.write().conflicts_resolved += 1;
                    self.emit(SyncEvent::Conflict(conflict.clone()));
                    result.conflicts.push(conflict);
                }

                if self.log.mark_applied(op.op_id)?.is_none() {
                    tracing::debug!(op_id = %op.op_id, "operation left the log while in flight");
                    return Ok(Step::Applied);
                }
                if !self.log.has_unapplied_for(&key) {
                    let now = self.clock.now_millis();
                    if let Err(e) = self
                        .cache
                        .replace_authoritative(&key, outcome.committed.as_ref(), now)
                    {
                        tracing::warn!(key = %key, error = %e, "could not store committed row");
                    }
                }

                self.stats.write().operations_applied += 1;
                result.applied += 1;
                tracing::debug!(op_id = %op.op_id, key = %key, "operation applied");
                self.emit(SyncEvent::Applied {
                    op_id: op.op_id,
                    key,
                });
                Ok(Step::Applied)
            }
            Err(e) => self.record_failure(op, key, e, result),
        }
    }

    fn record_failure(
        &self,
        op: &QueuedOperation,
        key: RecordKey,
        error: RemoteError,
        result: &mut SyncCycleResult,
    ) -> SyncResult<Step> {
        let message = error.to_string();
        self.stats.write().last_error = Some(message.clone());

        match error.class() {
            // A conflict reaching here means the row changed again while the
            // local write was being re-issued; the next cycle re-resolves it.
            ErrorClass::TransientNetwork | ErrorClass::Conflict => {
                self.log.mark_retryable(op.op_id, &message)?;
                self.stats.write().deferrals += 1;
                result.deferred += 1;
                tracing::debug!(op_id = %op.op_id, key = %key, error = %message, "operation deferred");
                self.emit(SyncEvent::Deferred {
                    op_id: op.op_id,
                    key,
                    error: message,
                });
                Ok(Step::Deferred)
            }
            ErrorClass::Application => {
                let now = self.clock.now_millis();
                let Some(updated) =
                    self.log
                        .mark_failed(op.op_id, &message, &self.config.retry, now)?
                else {
                    return Ok(Step::Rejected);
                };
                self.stats.write().rejections += 1;
                result.rejected += 1;

                if updated.status.is_permanently_failed() {
                    self.stats.write().permanent_failures += 1;
                    result.permanently_failed += 1;
                    tracing::error!(
                        op_id = %op.op_id,
                        key = %key,
                        attempts = updated.attempts,
                        error = %message,
                        "operation permanently failed"
                    );
                    self.emit(SyncEvent::PermanentlyFailed {
                        op_id: op.op_id,
                        key,
                        error: message,
                    });
                } else {
                    let retry_at = updated.next_attempt_at.unwrap_or(now);
                    tracing::warn!(
                        op_id = %op.op_id,
                        key = %key,
                        attempts = updated.attempts,
                        retry_at,
                        error = %message,
                        "operation rejected"
                    );
                    self.emit(SyncEvent::Rejected {
                        op_id: op.op_id,
                        key,
                        attempts: updated.attempts,
                        retry_at,
                        error: message,
                    });
                }
                Ok(Step::Rejected)
            }
        }
    }

    /// Flushes the underlying store.
    pub fn flush_store(&self) -> SyncResult<()> {
        self.store.flush()?;
        Ok(())
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::connectivity::ManualConnectivity;
    use crate::memory_remote::MemoryRemote;
    use offsync_protocol::{ConflictPolicy, OperationStatus};
    use offsync_storage::InMemoryStore;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        id: String,
        title: String,
        completed: bool,
    }

    fn task(id: &str, completed: bool) -> Task {
        Task {
            id: id.into(),
            title: format!("task {id}"),
            completed,
        }
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        remote: Arc<MemoryRemote>,
        connectivity: Arc<ManualConnectivity>,
        clock: Arc<ManualClock>,
        engine: SyncEngine<MemoryRemote>,
    }

    fn harness(online: bool) -> Harness {
        harness_with(online, SyncConfig::default())
    }

    fn harness_with(online: bool, config: SyncConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let remote = Arc::new(MemoryRemote::new());
        let connectivity = Arc::new(ManualConnectivity::new(online));
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = SyncEngine::open(
            config.with_request_timeout(Duration::from_millis(100)),
            store.clone(),
            remote.clone(),
            connectivity.clone(),
            clock.clone(),
        )
        .unwrap();
        Harness {
            store,
            remote,
            connectivity,
            clock,
            engine,
        }
    }

    #[test]
    fn queue_updates_cache_and_status() {
        let h = harness(false);
        let op_id = h
            .engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", false))
            .unwrap();

        assert_eq!(op_id, OpId(1));
        assert_eq!(h.engine.get_from_cache::<Task>("tasks"), vec![task("1", false)]);
        let status = h.engine.get_sync_status();
        assert_eq!((status.pending, status.failed, status.last_sync), (1, 0, None));
        assert_eq!(h.engine.sync_indicator(), SyncIndicator::Offline);
    }

    #[test]
    fn queue_assigns_increasing_versions() {
        let h = harness(false);
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", false))
            .unwrap();
        h.engine
            .queue_operation(OperationKind::Update, "tasks", &task("1", true))
            .unwrap();

        let ops = h.engine.pending_operations();
        assert_eq!(ops[0].write_version(), 1_000);
        assert_eq!(ops[1].write_version(), 1_001);
        assert_eq!(ops[1].base_version, Some(1_000));
    }

    #[test]
    fn queue_rejects_bad_input() {
        let h = harness(false);
        assert!(matches!(
            h.engine
                .queue_operation(OperationKind::Insert, "tasks", &json!({"title": "no id"})),
            Err(SyncError::InvalidRecord(_))
        ));
        assert!(matches!(
            h.engine
                .queue_operation(OperationKind::Insert, "a/b", &task("1", false)),
            Err(SyncError::InvalidRecord(_))
        ));
        assert_eq!(h.engine.get_sync_status().pending, 0);
    }

    #[test]
    fn queue_fails_when_storage_is_unavailable() {
        let h = harness(false);
        h.store.set_unavailable(true);

        let result = h
            .engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", false));
        assert!(matches!(result, Err(SyncError::Persistence(_))));
        assert!(h.engine.get_from_cache::<Task>("tasks").is_empty());
    }

    #[tokio::test]
    async fn flush_applies_and_marks_synced() {
        let h = harness(true);
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", true))
            .unwrap();

        let cycle = h.engine.flush().await.unwrap().unwrap();
        assert_eq!(cycle.applied, 1);
        assert!(cycle.is_clean());

        let status = h.engine.get_sync_status();
        assert_eq!((status.pending, status.failed), (0, 0));
        assert_eq!(status.last_sync, Some(1_000));
        assert_eq!(h.engine.sync_indicator(), SyncIndicator::Synced);
        assert_eq!(
            h.remote.get(&RecordKey::new("tasks", "1")).unwrap().field("completed"),
            Some(&json!(true))
        );
        assert_eq!(h.engine.stats().operations_applied, 1);
    }

    #[tokio::test]
    async fn flush_is_skipped_offline() {
        let h = harness(false);
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", true))
            .unwrap();

        assert!(h.engine.flush().await.unwrap().is_none());
        assert_eq!(h.remote.call_count(), 0);
    }

    #[tokio::test]
    async fn delete_removes_row_everywhere() {
        let h = harness(true);
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", false))
            .unwrap();
        h.engine.flush().await.unwrap();

        h.clock.advance(10);
        h.engine
            .queue_operation(OperationKind::Delete, "tasks", &task("1", false))
            .unwrap();
        assert!(h.engine.get_records("tasks").is_empty());

        h.engine.flush().await.unwrap();
        assert!(h.remote.get(&RecordKey::new("tasks", "1")).is_none());
        assert!(h.engine.get_records("tasks").is_empty());
    }

    #[tokio::test]
    async fn network_failure_keeps_operation_pending() {
        let h = harness(true);
        h.remote.set_offline(true);
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", true))
            .unwrap();

        let cycle = h.engine.flush().await.unwrap().unwrap();
        assert_eq!(cycle.deferred, 1);
        assert!(!cycle.is_clean());

        let op = h.engine.pending_operations().remove(0);
        assert_eq!(op.attempts, 0);
        assert_eq!(op.status, offsync_protocol::OperationStatus::Pending);
        assert_eq!(h.engine.get_sync_status().last_sync, None);
    }

    #[tokio::test]
    async fn rejection_blocks_only_its_record() {
        let h = harness(true);
        h.remote
            .reject_record(RecordKey::new("tasks", "bad"), "title required");
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("bad", false))
            .unwrap();
        h.engine
            .queue_operation(OperationKind::Update, "tasks", &task("bad", true))
            .unwrap();
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("good", false))
            .unwrap();

        let cycle = h.engine.flush().await.unwrap().unwrap();
        assert_eq!(cycle.applied, 1);
        assert_eq!(cycle.rejected, 1);
        assert_eq!(h.engine.state(), SyncState::BackoffWait);
        assert_eq!(h.engine.next_retry_delay(), Some(Duration::from_secs(2)));

        let ops = h.engine.pending_operations();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].attempts, 1);
        assert_eq!(ops[1].attempts, 0);
        assert!(h.remote.get(&RecordKey::new("tasks", "good")).is_some());
    }

    #[tokio::test]
    async fn retry_ceiling_then_manual_retry() {
        let config = SyncConfig::default().with_retry(RetryConfig::new(2));
        let h = harness_with(true, config);
        h.remote.reject_record(RecordKey::new("tasks", "1"), "no");
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", false))
            .unwrap();

        h.engine.flush().await.unwrap();
        h.clock.advance(2_000);
        let cycle = h.engine.flush().await.unwrap().unwrap();
        assert_eq!(cycle.permanently_failed, 1);

        let status = h.engine.get_sync_status();
        assert_eq!((status.pending, status.failed), (0, 1));
        assert_eq!(h.engine.sync_indicator(), SyncIndicator::Failed(1));

        h.remote.clear_rejections();
        assert_eq!(h.engine.retry_failed().unwrap(), 1);
        h.engine.flush().await.unwrap();
        assert_eq!(h.engine.get_sync_status().pending, 0);
        assert!(h.remote.get(&RecordKey::new("tasks", "1")).is_some());
    }

    #[tokio::test]
    async fn discard_drops_optimistic_row() {
        let config = SyncConfig::default().with_retry(RetryConfig::new(1));
        let h = harness_with(true, config);
        h.remote.reject_record(RecordKey::new("tasks", "1"), "no");
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", false))
            .unwrap();
        h.engine.flush().await.unwrap();

        let failed = h.engine.failed_operations();
        assert_eq!(failed.len(), 1);
        assert!(matches!(
            h.engine.retry_operation(OpId(99)),
            Err(SyncError::UnknownOperation(_))
        ));

        h.engine.discard_operation(failed[0].op_id).unwrap();
        assert!(h.engine.get_records("tasks").is_empty());
        assert_eq!(h.engine.get_sync_status().failed, 0);
        assert_eq!(h.engine.discard_failed().unwrap(), 0);
    }

    #[tokio::test]
    async fn conflict_with_newer_remote_is_applied_and_reported() {
        let h = harness_with(
            true,
            SyncConfig::default().with_conflict_policy(ConflictPolicy::LastWriteWins),
        );
        let remote_row = Record::from_row("tasks", &task("1", false), 500).unwrap();
        h.remote.seed([remote_row.clone()]);
        h.engine.refresh("tasks", &Filter::All).await.unwrap();

        h.remote.seed([Record::from_row("tasks", &task("1", true), 5_000).unwrap()]);
        h.engine
            .queue_operation(OperationKind::Update, "tasks", &task("1", false))
            .unwrap();
        let mut events = h.engine.subscribe();

        let cycle = h.engine.flush().await.unwrap().unwrap();
        assert_eq!(cycle.applied, 1);
        assert_eq!(cycle.conflicts.len(), 1);
        assert!(cycle.conflicts[0].local_lost());
        assert_eq!(h.engine.get_sync_status().pending, 0);
        assert_eq!(h.engine.get_from_cache::<Task>("tasks"), vec![task("1", true)]);
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Conflict(_)));
    }

    #[tokio::test]
    async fn refresh_keeps_pending_rows_and_drops_removed_ones() {
        let h = harness(true);
        h.remote.seed([
            Record::from_row("tasks", &task("1", false), 10).unwrap(),
            Record::from_row("tasks", &task("2", false), 10).unwrap(),
        ]);
        assert_eq!(h.engine.refresh("tasks", &Filter::All).await.unwrap(), 2);

        h.engine
            .queue_operation(OperationKind::Update, "tasks", &task("1", true))
            .unwrap();
        h.remote.seed([Record::from_row("tasks", &task("1", false), 20).unwrap()]);
        h.remote.remove(&RecordKey::new("tasks", "2"));

        h.engine.refresh("tasks", &Filter::All).await.unwrap();
        assert_eq!(h.engine.get_from_cache::<Task>("tasks"), vec![task("1", true)]);
    }

    #[tokio::test]
    async fn refresh_fails_when_remote_unreachable() {
        let h = harness(true);
        h.remote.set_offline(true);
        assert!(matches!(
            h.engine.refresh("tasks", &Filter::All).await,
            Err(SyncError::Remote(RemoteError::Network(_)))
        ));
    }

    #[tokio::test]
    async fn concurrent_flush_is_a_no_op() {
        let h = harness(true);
        h.remote.set_delay(Some(Duration::from_millis(30)));
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", false))
            .unwrap();

        let (first, second) = tokio::join!(h.engine.flush(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert_eq!(h.engine.state(), SyncState::Flushing);
            h.engine.flush().await
        });
        assert_eq!(first.unwrap().unwrap().applied, 1);
        assert!(second.unwrap().is_none());
        assert_eq!(h.engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn connectivity_loss_abandons_in_flight_call() {
        let h = harness(true);
        h.remote.stall_next(1);
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", false))
            .unwrap();

        let (cycle, _) = tokio::join!(h.engine.flush(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.connectivity.set_online(false);
        });
        let cycle = cycle.unwrap().unwrap();
        assert!(cycle.interrupted);
        assert_eq!(cycle.applied, 0);

        let status = h.engine.get_sync_status();
        assert_eq!((status.pending, status.failed), (1, 0));
        assert_eq!(h.engine.pending_operations()[0].attempts, 0);
    }

    #[tokio::test]
    async fn storage_failure_mid_cycle_does_not_strand_operation() {
        let h = harness(true);
        h.engine
            .queue_operation(OperationKind::Insert, "tasks", &task("1", false))
            .unwrap();
        h.remote.set_delay(Some(Duration::from_millis(40)));

        let (cycle, _) = tokio::join!(h.engine.flush(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.store.set_unavailable(true);
        });
        assert!(matches!(cycle, Err(SyncError::Persistence(_))));
        assert_eq!(
            h.engine.pending_operations()[0].status,
            OperationStatus::Pending
        );

        h.store.set_unavailable(false);
        h.remote.set_delay(None);
        h.engine.flush().await.unwrap().unwrap();
        assert_eq!(h.engine.get_sync_status().pending, 0);
        assert!(h.remote.get(&RecordKey::new("tasks", "1")).is_some());
    }
}
