//! Connectivity observation.
//!
//! The engine never probes the network itself. It reads the current state and
//! listens for transitions through a [`ConnectivityObserver`], which a host
//! backs with whatever reachability signal its platform offers.

use tokio::sync::watch;

/// Push-based view of online/offline state.
pub trait ConnectivityObserver: Send + Sync {
    /// Returns true if the host believes it is online.
    fn is_online(&self) -> bool;

    /// Returns a receiver that observes every transition.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven by explicit calls, e.g. from platform callbacks or tests.
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    /// Creates an observer with the given initial state.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Reports a connectivity change. Repeating the current state is a no-op.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityObserver for ManualConnectivity {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Waits until the receiver reports offline. Returns immediately if it already does.
///
/// If the sender is gone the state can no longer change, so this never resolves.
pub(crate) async fn wait_offline(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|online| !*online).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn manual_connectivity_state() {
        let conn = ManualConnectivity::new(false);
        assert!(!conn.is_online());
        conn.set_online(true);
        assert!(conn.is_online());
    }

    #[tokio::test]
    async fn subscribers_see_transitions_only() {
        let conn = ManualConnectivity::new(true);
        let mut rx = conn.subscribe();

        conn.set_online(true);
        assert!(!rx.has_changed().unwrap());

        conn.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn wait_offline_resolves_when_connectivity_drops() {
        let conn = ManualConnectivity::new(true);
        let mut rx = conn.subscribe();

        let waiter = tokio::spawn(async move { wait_offline(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        conn.set_online(false);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
