//! The application-facing sync manager.

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityObserver;
use crate::engine::{SyncCycleResult, SyncEngine, SyncState, SyncStats};
use crate::error::{SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::remote::RemoteStore;
use crate::scheduler;
use offsync_protocol::{Filter, OpId, OperationKind, QueuedOperation, Record, SyncIndicator, SyncStatus};
use offsync_storage::PersistentStore;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Offline-first sync manager.
///
/// The only surface application code needs: queue writes, read the cache,
/// show status and trigger syncs. Each manager owns its own engine and
/// scheduler task, so several can run side by side (one per account, say).
///
/// # Example
///
/// ```rust,no_run
/// use offsync_engine::{ManualConnectivity, MemoryRemote, SyncConfig, SyncManager};
/// use offsync_protocol::OperationKind;
/// use offsync_storage::InMemoryStore;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn demo() -> offsync_engine::SyncResult<()> {
/// let manager = SyncManager::init(
///     SyncConfig::default(),
///     Arc::new(InMemoryStore::new()),
///     Arc::new(MemoryRemote::new()),
///     Arc::new(ManualConnectivity::new(true)),
/// )
/// .await?;
///
/// manager.queue_operation(OperationKind::Update, "tasks", &json!({"id": "t1", "completed": true}))?;
/// let status = manager.get_sync_status();
/// println!("{} pending, {} failed", status.pending, status.failed);
///
/// manager.dispose().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncManager<R: RemoteStore + 'static> {
    engine: Arc<SyncEngine<R>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<R: RemoteStore + 'static> SyncManager<R> {
    /// Opens the engine over `store` and starts the scheduler.
    pub async fn init(
        config: SyncConfig,
        store: Arc<dyn PersistentStore>,
        remote: Arc<R>,
        connectivity: Arc<dyn ConnectivityObserver>,
    ) -> SyncResult<Self> {
        Self::init_with_clock(config, store, remote, connectivity, Arc::new(SystemClock)).await
    }

    /// Like [`init`](Self::init) with an explicit clock.
    pub async fn init_with_clock(
        config: SyncConfig,
        store: Arc<dyn PersistentStore>,
        remote: Arc<R>,
        connectivity: Arc<dyn ConnectivityObserver>,
        clock: Arc<dyn Clock>,
    ) -> SyncResult<Self> {
        let engine = Arc::new(SyncEngine::open(config, store, remote, connectivity, clock)?);
        let (shutdown, rx) = watch::channel(false);
        let task = scheduler::spawn(engine.clone(), rx);

        Ok(Self {
            engine,
            shutdown,
            task: Mutex::new(Some(task)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Stops the scheduler and waits for it, then flushes the store.
    ///
    /// A flush cycle that is running finishes first. Later calls fail with
    /// [`SyncError::Disposed`]; reads keep working.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "sync scheduler ended abnormally");
            }
        }
        if let Err(e) = self.engine.flush_store() {
            tracing::warn!(error = %e, "store flush on dispose failed");
        }
        tracing::info!("sync manager disposed");
    }

    /// Returns true once [`dispose`](Self::dispose) was called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Returns the engine.
    pub fn engine(&self) -> &Arc<SyncEngine<R>> {
        &self.engine
    }

    /// Durably queues a mutation of `row` in `table`.
    ///
    /// The cache reflects the write immediately. Fails only if the row has no
    /// usable `id`, the table name is invalid, or local storage is unavailable.
    pub fn queue_operation<T: Serialize + ?Sized>(
        &self,
        kind: OperationKind,
        table: &str,
        row: &T,
    ) -> SyncResult<OpId> {
        self.ensure_active()?;
        self.engine.queue_operation(kind, table, row)
    }

    /// Returns the cached rows of `table`; empty if nothing is cached.
    pub fn get_from_cache<T: DeserializeOwned>(&self, table: &str) -> Vec<T> {
        self.engine.get_from_cache(table)
    }

    /// Returns the cached rows of `table` untyped.
    pub fn get_records(&self, table: &str) -> Vec<Record> {
        self.engine.get_records(table)
    }

    /// Returns pending/failed counts and the last clean sync time.
    pub fn get_sync_status(&self) -> SyncStatus {
        self.engine.get_sync_status()
    }

    /// Returns what a status widget should show.
    pub fn sync_indicator(&self) -> SyncIndicator {
        self.engine.sync_indicator()
    }

    /// Returns true if the host is online.
    pub fn is_online(&self) -> bool {
        self.engine.is_online()
    }

    /// Returns the engine state.
    pub fn state(&self) -> SyncState {
        self.engine.state()
    }

    /// Returns engine statistics.
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Asks the scheduler for an immediate flush.
    ///
    /// A no-op while a flush is running; that cycle picks up new work.
    /// Returns true if a flush was requested.
    pub fn force_sync(&self) -> bool {
        if self.is_disposed() || self.engine.is_flushing() {
            return false;
        }
        self.engine.wake();
        true
    }

    /// Runs a flush cycle on the calling task and waits for it.
    ///
    /// Returns `Ok(None)` if a cycle is already running or the host is offline.
    pub async fn sync_now(&self) -> SyncResult<Option<SyncCycleResult>> {
        self.ensure_active()?;
        self.engine.flush().await
    }

    /// Fetches rows from the remote into the cache.
    pub async fn refresh(&self, table: &str, filter: &Filter) -> SyncResult<usize> {
        self.ensure_active()?;
        self.engine.refresh(table, filter).await
    }

    /// Returns every operation not yet confirmed.
    pub fn pending_operations(&self) -> Vec<QueuedOperation> {
        self.engine.pending_operations()
    }

    /// Returns the operations that need a user decision.
    pub fn failed_operations(&self) -> Vec<QueuedOperation> {
        self.engine.failed_operations()
    }

    /// Retries every permanently failed operation.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        self.ensure_active()?;
        self.engine.retry_failed()
    }

    /// Retries one permanently failed operation.
    pub fn retry_operation(&self, op_id: OpId) -> SyncResult<()> {
        self.ensure_active()?;
        self.engine.retry_operation(op_id)
    }

    /// Drops one permanently failed operation.
    pub fn discard_operation(&self, op_id: OpId) -> SyncResult<()> {
        self.ensure_active()?;
        self.engine.discard_operation(op_id)
    }

    /// Drops every permanently failed operation.
    pub fn discard_failed(&self) -> SyncResult<usize> {
        self.ensure_active()?;
        self.engine.discard_failed()
    }

    /// Subscribes to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    fn ensure_active(&self) -> SyncResult<()> {
        if self.is_disposed() {
            Err(SyncError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl<R: RemoteStore + 'static> Drop for SyncManager<R> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connectivity::ManualConnectivity;
    use crate::memory_remote::MemoryRemote;
    use offsync_storage::InMemoryStore;
    use serde_json::json;
    use std::time::Duration;

    async fn manager(online: bool) -> (SyncManager<MemoryRemote>, Arc<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::new());
        let manager = SyncManager::init_with_clock(
            SyncConfig::default().without_sync_interval(),
            Arc::new(InMemoryStore::new()),
            remote.clone(),
            Arc::new(ManualConnectivity::new(online)),
            Arc::new(ManualClock::new(1)),
        )
        .await
        .unwrap();
        (manager, remote)
    }

    #[tokio::test]
    async fn dispose_blocks_writes_but_not_reads() {
        let (manager, _) = manager(false).await;
        manager
            .queue_operation(OperationKind::Insert, "tasks", &json!({"id": "1"}))
            .unwrap();

        manager.dispose().await;
        manager.dispose().await;
        assert!(manager.is_disposed());
        assert!(matches!(
            manager.queue_operation(OperationKind::Insert, "tasks", &json!({"id": "2"})),
            Err(SyncError::Disposed)
        ));
        assert!(matches!(manager.sync_now().await, Err(SyncError::Disposed)));
        assert!(!manager.force_sync());
        assert_eq!(manager.get_records("tasks").len(), 1);
        assert_eq!(manager.get_sync_status().pending, 1);
    }

    #[tokio::test]
    async fn force_sync_flushes() {
        let (manager, remote) = manager(true).await;
        manager.engine().log().enqueue(
            OperationKind::Insert,
            Record::from_row("tasks", &json!({"id": "1"}), 1).unwrap(),
            None,
            1,
        )
        .unwrap();

        assert!(manager.force_sync());
        for _ in 0..100 {
            if manager.get_sync_status().pending == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.get_sync_status().pending, 0);
        assert_eq!(remote.write_count(), 1);
        assert_eq!(manager.sync_indicator(), SyncIndicator::Synced);
        manager.dispose().await;
    }

    #[tokio::test]
    async fn independent_managers_do_not_share_state() {
        let (a, _) = manager(false).await;
        let (b, _) = manager(false).await;

        a.queue_operation(OperationKind::Insert, "tasks", &json!({"id": "1"}))
            .unwrap();
        assert_eq!(a.get_sync_status().pending, 1);
        assert_eq!(b.get_sync_status().pending, 0);
        assert!(b.get_from_cache::<serde_json::Value>("tasks").is_empty());
    }
}
