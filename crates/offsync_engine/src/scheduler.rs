//! Background task that decides when to flush.

use crate::engine::SyncEngine;
use crate::events::SyncEvent;
use crate::remote::RemoteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

/// Smallest wait before re-checking backoff timers.
const MIN_BACKOFF_POLL: Duration = Duration::from_millis(10);

/// Spawns the scheduler on the current runtime.
///
/// A flush is started when connectivity comes back, on every periodic tick,
/// when work is queued or retried, and when the earliest backoff timer
/// expires. The task stops once `shutdown` turns `true` or its sender is gone.
pub(crate) fn spawn<R>(engine: Arc<SyncEngine<R>>, shutdown: watch::Receiver<bool>) -> JoinHandle<()>
where
    R: RemoteStore + 'static,
{
    tokio::spawn(run(engine, shutdown))
}

async fn run<R: RemoteStore + 'static>(engine: Arc<SyncEngine<R>>, mut shutdown: watch::Receiver<bool>) {
    let mut connectivity = engine.connectivity().subscribe();
    let mut online = *connectivity.borrow_and_update();
    let mut connectivity_open = true;
    let mut ticker = engine.config().sync_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    tracing::debug!(online, "sync scheduler started");

    loop {
        if *shutdown.borrow() {
            break;
        }
        if online {
            if let Err(e) = engine.flush().await {
                tracing::error!(error = %e, "flush cycle failed");
            }
        }

        let backoff = if online {
            engine.next_retry_delay().map(|d| d.max(MIN_BACKOFF_POLL))
        } else {
            None
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            state = next_connectivity(&mut connectivity, connectivity_open) => {
                match state {
                    Some(now_online) if now_online != online => {
                        online = now_online;
                        tracing::info!(online, "connectivity changed");
                        engine.emit(SyncEvent::ConnectivityChanged { online });
                    }
                    Some(_) => {}
                    None => connectivity_open = false,
                }
            }
            _ = next_tick(&mut ticker) => {}
            _ = engine.woken() => {}
            _ = sleep_for(backoff) => {}
        }
    }

    tracing::debug!("sync scheduler stopped");
}

async fn next_connectivity(rx: &mut watch::Receiver<bool>, open: bool) -> Option<bool> {
    if !open {
        std::future::pending::<()>().await;
    }
    match rx.changed().await {
        Ok(()) => Some(*rx.borrow_and_update()),
        Err(_) => None,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{RetryConfig, SyncConfig};
    use crate::connectivity::ManualConnectivity;
    use crate::memory_remote::MemoryRemote;
    use offsync_protocol::{OperationKind, RecordKey};
    use offsync_storage::InMemoryStore;
    use serde_json::json;

    fn engine(
        online: bool,
        config: SyncConfig,
    ) -> (Arc<SyncEngine<MemoryRemote>>, Arc<MemoryRemote>, Arc<ManualConnectivity>) {
        let remote = Arc::new(MemoryRemote::new());
        let connectivity = Arc::new(ManualConnectivity::new(online));
        let engine = SyncEngine::open(
            config,
            Arc::new(InMemoryStore::new()),
            remote.clone(),
            connectivity.clone(),
            Arc::new(SystemClock),
        )
        .unwrap();
        (Arc::new(engine), remote, connectivity)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn reconnect_triggers_flush() {
        let (engine, remote, connectivity) =
            engine(false, SyncConfig::default().without_sync_interval());
        let (stop, shutdown) = watch::channel(false);
        let task = spawn(engine.clone(), shutdown);

        engine
            .queue_operation(OperationKind::Insert, "tasks", &json!({"id": "1"}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(remote.call_count(), 0);

        let mut events = engine.subscribe();
        connectivity.set_online(true);
        eventually(|| engine.get_sync_status().pending == 0).await;
        assert!(remote.get(&RecordKey::new("tasks", "1")).is_some());
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::ConnectivityChanged { online: true }
        );

        stop.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn queueing_online_flushes_promptly() {
        let (engine, remote, _connectivity) =
            engine(true, SyncConfig::default().without_sync_interval());
        let (_stop, shutdown) = watch::channel(false);
        let _task = spawn(engine.clone(), shutdown);

        engine
            .queue_operation(OperationKind::Insert, "tasks", &json!({"id": "1"}))
            .unwrap();
        eventually(|| remote.get(&RecordKey::new("tasks", "1")).is_some()).await;
    }

    #[tokio::test]
    async fn backoff_timer_retries_rejected_operation() {
        let retry = RetryConfig::default().with_initial_delay(Duration::from_millis(20));
        let (engine, remote, _connectivity) = engine(
            true,
            SyncConfig::default().without_sync_interval().with_retry(retry),
        );
        remote.reject_next(1, "busy");
        let (_stop, shutdown) = watch::channel(false);
        let _task = spawn(engine.clone(), shutdown);

        engine
            .queue_operation(OperationKind::Insert, "tasks", &json!({"id": "1"}))
            .unwrap();
        eventually(|| engine.get_sync_status().pending == 0).await;
        assert_eq!(engine.stats().rejections, 1);
    }

    #[tokio::test]
    async fn periodic_tick_picks_up_work() {
        let (engine, remote, _connectivity) =
            engine(true, SyncConfig::default().with_sync_interval(Duration::from_millis(20)));
        remote.set_offline(true);
        let (_stop, shutdown) = watch::channel(false);
        let _task = spawn(engine.clone(), shutdown);

        engine
            .queue_operation(OperationKind::Insert, "tasks", &json!({"id": "1"}))
            .unwrap();
        eventually(|| engine.stats().deferrals > 0).await;

        remote.set_offline(false);
        eventually(|| engine.get_sync_status().pending == 0).await;
    }

    #[tokio::test]
    async fn dropping_shutdown_sender_stops_task() {
        let (engine, _remote, _connectivity) = engine(true, SyncConfig::default());
        let (stop, shutdown) = watch::channel(false);
        let task = spawn(engine, shutdown);

        drop(stop);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
