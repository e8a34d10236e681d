//! Reclaimer interacting with live session traffic.

use std::sync::Arc;
use std::time::Duration;

use gamegrid_activity::ActivityTracker;
use gamegrid_core::{GameEntry, PoolSettings, StreamingSettings};
use gamegrid_provider::SimulatedProvider;
use gamegrid_reclaim::IdleReclaimer;
use gamegrid_scheduler::{Allocator, SessionBinder, StaticCatalog};
use gamegrid_state::{Registry, VmState, epoch_millis};

const HOUR: u64 = 60 * 60 * 1000;

struct Pool {
    registry: Registry,
    provider: Arc<SimulatedProvider>,
    binder: Arc<SessionBinder>,
    reclaimer: Arc<IdleReclaimer>,
}

fn pool() -> Pool {
    let settings = PoolSettings {
        poll_interval: Duration::from_millis(2),
        max_poll_backoff: Duration::from_millis(10),
        provision_timeout: Duration::from_secs(2),
        provider_call_timeout: Duration::from_secs(2),
        ..PoolSettings::default()
    };
    let registry = Registry::open_in_memory().unwrap();
    let provider = Arc::new(SimulatedProvider::new());
    let catalog = StaticCatalog::new([GameEntry {
        id: "racer".into(),
        name: None,
        max_sessions_per_vm: 1,
    }]);
    let binder = SessionBinder::new(
        registry.clone(),
        Allocator::new(registry.clone(), provider.clone(), settings.clone()),
        Arc::new(catalog),
        StreamingSettings::default(),
        ActivityTracker::new(registry.clone(), None),
    );
    let reclaimer = IdleReclaimer::new(registry.clone(), provider.clone(), settings);
    Pool {
        registry,
        provider,
        binder: Arc::new(binder),
        reclaimer: Arc::new(reclaimer),
    }
}

#[tokio::test]
async fn active_session_keeps_vm_running() {
    let pool = pool();
    let ticket = pool.binder.start_session("alice", "racer").await.unwrap();

    let report = pool.reclaimer.run_cycle_at(epoch_millis() + HOUR).await.unwrap();
    assert!(report.stopped.is_empty());
    assert_eq!(
        pool.registry.get(&ticket.vm_id).unwrap().unwrap().state,
        VmState::Running
    );
}

#[tokio::test]
async fn stopped_vm_is_not_resumed() {
    let pool = pool();
    let first = pool.binder.start_session("alice", "racer").await.unwrap();
    pool.binder.end_session(&first.session_id, "alice").await.unwrap();

    let report = pool.reclaimer.run_cycle_at(epoch_millis() + HOUR).await.unwrap();
    assert_eq!(report.stopped, vec![first.vm_id.clone()]);

    let second = pool.binder.start_session("bob", "racer").await.unwrap();
    assert!(second.provisioned);
    assert_ne!(second.vm_id, first.vm_id);
    assert_eq!(
        pool.registry.get(&first.vm_id).unwrap().unwrap().state,
        VmState::Stopped
    );
}

#[tokio::test]
async fn session_arriving_during_stop_gets_another_vm() {
    let pool = pool();
    let first = pool.binder.start_session("alice", "racer").await.unwrap();
    pool.binder.end_session(&first.session_id, "alice").await.unwrap();
    pool.provider.set_stop_delay(Duration::from_millis(200)).await;

    let cycle = {
        let reclaimer = pool.reclaimer.clone();
        tokio::spawn(async move { reclaimer.run_cycle_at(epoch_millis() + HOUR).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(pool.registry.get(&first.vm_id).unwrap().unwrap().draining);

    let second = pool.binder.start_session("bob", "racer").await.unwrap();
    assert_ne!(second.vm_id, first.vm_id);

    let report = cycle.await.unwrap().unwrap();
    assert_eq!(report.stopped, vec![first.vm_id.clone()]);

    let old = pool.registry.get(&first.vm_id).unwrap().unwrap();
    assert_eq!(old.state, VmState::Stopped);
    assert_eq!(old.load, 0);
    assert_eq!(pool.registry.get(&second.vm_id).unwrap().unwrap().load, 1);
}
