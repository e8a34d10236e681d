//! `run`: the long-lived reclaim process.
//!
//! There is no request transport, so `run` serves no session traffic: it
//! keeps the persisted pool in shape by running the idle reclaimer against
//! the on-disk registry. Sessions are driven in-process (see `simulate`).

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use gamegrid_provider::{InstanceStatus, ResourceProvider, SimulatedProvider};
use gamegrid_reclaim::IdleReclaimer;
use gamegrid_state::{Registry, VmRecord, VmState};

use crate::inspect::{DB_FILE, load_config};

pub async fn run(
    config_path: Option<PathBuf>,
    data_dir: PathBuf,
    boot_polls: u32,
) -> anyhow::Result<()> {
    info!("GameGrid daemon starting");

    let config = load_config(config_path.as_deref())?;
    let settings = config.pool_settings()?;
    // Validated here so a bad catalog fails at startup.
    let games = config.games()?;

    // ── Initialize subsystems ──────────────────────────────────

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join(DB_FILE);
    let registry = Registry::open(&db_path)?;
    let vms = registry.list_vms()?;
    info!(
        path = ?db_path,
        vms = vms.len(),
        running = vms.iter().filter(|vm| vm.state == VmState::Running).count(),
        games = games.len(),
        "registry opened"
    );

    let provider: Arc<dyn ResourceProvider> = Arc::new(adopt_persisted(
        SimulatedProvider::new().with_boot_polls(boot_polls),
        &vms,
    ));
    info!(boot_polls, adopted = vms.len(), "simulated provider initialized");

    let reclaimer = IdleReclaimer::new(registry, provider, settings);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reclaim_handle = tokio::spawn(async move {
        reclaimer.run(shutdown_rx).await;
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "could not listen for Ctrl-C, shutting down"),
    }
    let _ = shutdown_tx.send(true);
    let _ = reclaim_handle.await;

    info!("GameGrid daemon stopped");
    Ok(())
}

/// Hand every persisted VM to the simulated provider.
///
/// The provider lives only as long as the process; without this a restart
/// would leave every recorded VM unknown to it.
fn adopt_persisted(provider: SimulatedProvider, vms: &[VmRecord]) -> SimulatedProvider {
    vms.iter().fold(provider, |provider, vm| {
        let status = match vm.state {
            VmState::Provisioning => InstanceStatus::Booting,
            VmState::Running => InstanceStatus::Ready,
            VmState::Stopped => InstanceStatus::Stopped,
            VmState::Terminated => InstanceStatus::Terminated,
        };
        provider.with_existing_instance(&vm.id, vm.address.as_deref(), status)
    })
}
