//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use offsync_engine::{
    ManualClock, ManualConnectivity, MemoryRemote, SyncConfig, SyncEngine,
};
use offsync_storage::{InMemoryStore, PersistentStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub completed: bool,
}

pub fn task(id: &str, completed: bool) -> Task {
    Task {
        id: id.into(),
        title: format!("task {id}"),
        completed,
    }
}

/// One client process: its own store, clock and connectivity.
pub struct Client {
    pub store: Arc<dyn PersistentStore>,
    pub connectivity: Arc<ManualConnectivity>,
    pub clock: Arc<ManualClock>,
    pub engine: SyncEngine<MemoryRemote>,
}

pub fn test_config() -> SyncConfig {
    SyncConfig::default()
        .without_sync_interval()
        .with_request_timeout(Duration::from_millis(50))
}

pub fn client(remote: &Arc<MemoryRemote>, online: bool, now: u64) -> Client {
    client_over(Arc::new(InMemoryStore::new()), remote, online, now, test_config())
}

pub fn client_over(
    store: Arc<dyn PersistentStore>,
    remote: &Arc<MemoryRemote>,
    online: bool,
    now: u64,
    config: SyncConfig,
) -> Client {
    let connectivity = Arc::new(ManualConnectivity::new(online));
    let clock = Arc::new(ManualClock::new(now));
    let engine = SyncEngine::open(
        config,
        store.clone(),
        remote.clone(),
        connectivity.clone(),
        clock.clone(),
    )
    .unwrap();
    Client {
        store,
        connectivity,
        clock,
        engine,
    }
}
