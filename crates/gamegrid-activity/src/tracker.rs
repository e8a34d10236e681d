//! Activity tracker: touches and per-session heartbeat tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gamegrid_state::{Registry, StateResult, VmState};

/// Per-session heartbeat state.
struct HeartbeatSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Records VM activity and keeps active sessions' VMs fresh.
#[derive(Clone)]
pub struct ActivityTracker {
    registry: Registry,
    heartbeat_interval: Option<Duration>,
    /// Active heartbeats: session_id → slot.
    heartbeats: Arc<RwLock<HashMap<String, HeartbeatSlot>>>,
}

impl ActivityTracker {
    /// Create a tracker. `None` disables heartbeat tasks.
    pub fn new(registry: Registry, heartbeat_interval: Option<Duration>) -> Self {
        Self {
            registry,
            heartbeat_interval,
            heartbeats: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Touch a VM now. Returns whether `last_activity` advanced.
    pub fn touch(&self, vm_id: &str) -> StateResult<bool> {
        self.registry.touch_activity(vm_id)
    }

    /// Touch a VM at an explicit timestamp; never moves `last_activity` back.
    pub fn touch_at(&self, vm_id: &str, at: u64) -> StateResult<bool> {
        self.registry.touch_activity_at(vm_id, at)
    }

    pub fn heartbeats_enabled(&self) -> bool {
        self.heartbeat_interval.is_some()
    }

    /// Start heartbeating `vm_id` on behalf of `session_id`.
    ///
    /// No-op when heartbeats are disabled. Watching the same session again
    /// replaces the previous task.
    pub async fn watch(&self, session_id: &str, vm_id: &str) {
        let Some(interval) = self.heartbeat_interval else {
            return;
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session_owned = session_id.to_string();
        let vm_owned = vm_id.to_string();
        let registry = self.registry.clone();

        let handle = tokio::spawn(async move {
            run_heartbeat_loop(&session_owned, &vm_owned, interval, registry, shutdown_rx).await;
        });

        let mut heartbeats = self.heartbeats.write().await;
        if let Some(old) = heartbeats.insert(
            session_id.to_string(),
            HeartbeatSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }

        debug!(%session_id, %vm_id, ?interval, "heartbeat started");
    }

    /// Stop heartbeating for a session.
    pub async fn unwatch(&self, session_id: &str) {
        let mut heartbeats = self.heartbeats.write().await;
        if let Some(slot) = heartbeats.remove(session_id) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%session_id, "heartbeat stopped");
        }
    }

    /// Stop all heartbeats (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut heartbeats = self.heartbeats.write().await;
        let count = heartbeats.len();
        for (_, slot) in heartbeats.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
        info!(count, "all heartbeats stopped");
    }

    /// Session ids with a running heartbeat.
    pub async fn watched_sessions(&self) -> Vec<String> {
        let heartbeats = self.heartbeats.read().await;
        heartbeats.keys().cloned().collect()
    }

    pub async fn is_watching(&self, session_id: &str) -> bool {
        let heartbeats = self.heartbeats.read().await;
        heartbeats.contains_key(session_id)
    }
}

async fn run_heartbeat_loop(
    session_id: &str,
    vm_id: &str,
    interval: Duration,
    registry: Registry,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match registry.get(vm_id) {
                    Ok(Some(vm)) if vm.state == VmState::Running => {
                        match registry.touch_activity(vm_id) {
                            Ok(_) => debug!(%session_id, %vm_id, "heartbeat"),
                            Err(e) => warn!(%session_id, %vm_id, error = %e, "heartbeat touch failed"),
                        }
                    }
                    Ok(vm) => {
                        let state = vm.map(|vm| vm.state);
                        warn!(%session_id, %vm_id, ?state, "vm no longer running, heartbeat ending");
                        break;
                    }
                    Err(e) => warn!(%session_id, %vm_id, error = %e, "heartbeat lookup failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!(%session_id, "heartbeat loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use gamegrid_state::StateError;

    use super::*;

    fn registry_with_vm(id: &str) -> Registry {
        let registry = Registry::open_in_memory().unwrap();
        running_vm(&registry, id);
        registry
    }

    fn running_vm(registry: &Registry, id: &str) {
        registry.create(id, 1).unwrap();
        registry.activate(id, "10.0.0.1").unwrap();
    }

    #[test]
    fn touch_is_monotonic() {
        let registry = registry_with_vm("i-1");
        let tracker = ActivityTracker::new(registry.clone(), None);
        let ahead = gamegrid_state::epoch_millis() + 60_000;

        assert!(tracker.touch_at("i-1", ahead).unwrap());
        assert!(!tracker.touch_at("i-1", ahead).unwrap());
        assert!(!tracker.touch_at("i-1", ahead - 500).unwrap());
        assert!(!tracker.touch("i-1").unwrap());
        assert_eq!(registry.get("i-1").unwrap().unwrap().last_activity, ahead);
    }

    #[test]
    fn touch_unknown_vm_is_not_found() {
        let tracker = ActivityTracker::new(Registry::open_in_memory().unwrap(), None);
        assert!(matches!(tracker.touch("i-404"), Err(StateError::NotFound(_))));
    }

    #[tokio::test]
    async fn watch_is_noop_when_disabled() {
        let tracker = ActivityTracker::new(registry_with_vm("i-1"), None);
        tracker.watch("s-1", "i-1").await;

        assert!(!tracker.heartbeats_enabled());
        assert!(tracker.watched_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_advances_activity() {
        let registry = registry_with_vm("i-1");
        let before = registry.get("i-1").unwrap().unwrap().last_activity;
        let tracker = ActivityTracker::new(registry.clone(), Some(Duration::from_millis(10)));

        tracker.watch("s-1", "i-1").await;
        assert!(tracker.is_watching("s-1").await);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let after = registry.get("i-1").unwrap().unwrap().last_activity;
        assert!(after > before);

        tracker.unwatch("s-1").await;
        assert!(!tracker.is_watching("s-1").await);
    }

    #[tokio::test]
    async fn heartbeat_ends_once_vm_stops_running() {
        let registry = registry_with_vm("i-1");
        let tracker = ActivityTracker::new(registry.clone(), Some(Duration::from_millis(10)));
        tracker.watch("s-1", "i-1").await;

        registry.decrement_load("i-1").unwrap();
        registry.set_state("i-1", VmState::Stopped).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stopped_at = registry.get("i-1").unwrap().unwrap().last_activity;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(registry.get("i-1").unwrap().unwrap().last_activity, stopped_at);
    }

    #[tokio::test]
    async fn watch_replaces_and_stop_all_clears() {
        let registry = registry_with_vm("i-1");
        running_vm(&registry, "i-2");
        let tracker = ActivityTracker::new(registry, Some(Duration::from_secs(60)));

        tracker.watch("s-1", "i-1").await;
        tracker.watch("s-1", "i-1").await;
        tracker.watch("s-2", "i-2").await;
        assert_eq!(tracker.watched_sessions().await.len(), 2);

        tracker.stop_all().await;
        assert!(tracker.watched_sessions().await.is_empty());
    }
}
