//! Idle reclaimer control loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gamegrid_core::PoolSettings;
use gamegrid_provider::{ProviderHandle, ProviderResult, ResourceProvider};
use gamegrid_state::{Registry, StopGate, VmRecord, VmState, epoch_millis};

use crate::error::{ReclaimError, ReclaimResult};

/// What one reclaim cycle did, by VM id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Idle VMs stopped at the provider and recorded `Stopped`.
    pub stopped: Vec<String>,
    /// Candidates that gained load or activity before the re-check.
    pub skipped: Vec<String>,
    /// VMs whose provider call or registry update failed; retried next cycle.
    pub failed: Vec<String>,
    /// Long-stopped VMs terminated.
    pub terminated: Vec<String>,
    /// Abandoned `Provisioning` records moved to `Terminated`.
    pub reaped: Vec<String>,
}

impl CycleReport {
    /// Whether the cycle changed nothing and hit no errors.
    pub fn is_quiet(&self) -> bool {
        self.stopped.is_empty()
            && self.skipped.is_empty()
            && self.failed.is_empty()
            && self.terminated.is_empty()
            && self.reaped.is_empty()
    }
}

/// Stops VMs that have been empty and inactive for `idle_timeout`.
pub struct IdleReclaimer {
    registry: Registry,
    provider: Arc<dyn ResourceProvider>,
    settings: PoolSettings,
}

impl IdleReclaimer {
    pub fn new(
        registry: Registry,
        provider: Arc<dyn ResourceProvider>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            registry,
            provider,
            settings,
        }
    }

    /// Run one cycle against the current time.
    pub async fn run_cycle(&self) -> ReclaimResult<CycleReport> {
        self.run_cycle_at(epoch_millis()).await
    }

    /// Run one cycle as if the clock read `now` (epoch millis).
    pub async fn run_cycle_at(&self, now: u64) -> ReclaimResult<CycleReport> {
        let mut report = CycleReport::default();

        let idle_threshold = now.saturating_sub(millis(self.settings.idle_timeout));
        for vm in self.registry.list_idle_candidates(idle_threshold)? {
            self.reclaim(&vm.id, idle_threshold, &mut report).await;
        }

        if let Some(after) = self.settings.terminate_stopped_after {
            let horizon = now.saturating_sub(millis(after));
            for vm in self.registry.list_stopped_before(horizon)? {
                match self.terminate_vm(&vm.id).await {
                    Ok(_) => report.terminated.push(vm.id),
                    Err(e) => {
                        warn!(vm_id = %vm.id, error = %e, "termination of stopped vm failed");
                        report.failed.push(vm.id);
                    }
                }
            }
        }

        self.reap_abandoned(now, &mut report).await?;

        if report.is_quiet() {
            debug!("reclaim cycle: nothing to do");
        } else {
            info!(
                stopped = report.stopped.len(),
                skipped = report.skipped.len(),
                failed = report.failed.len(),
                terminated = report.terminated.len(),
                reaped = report.reaped.len(),
                "reclaim cycle complete"
            );
        }
        Ok(report)
    }

    /// Re-check one candidate, stop it at the provider, record `Stopped`.
    async fn reclaim(&self, vm_id: &str, threshold: u64, report: &mut CycleReport) {
        match self.registry.begin_stop(vm_id, threshold) {
            Ok(StopGate::Draining(_)) => {}
            Ok(gate) => {
                debug!(%vm_id, ?gate, "candidate no longer idle");
                report.skipped.push(vm_id.to_string());
                return;
            }
            Err(e) => {
                warn!(%vm_id, error = %e, "could not mark vm draining");
                report.failed.push(vm_id.to_string());
                return;
            }
        }

        let handle = ProviderHandle::new(vm_id);
        match self.provider_call(self.provider.stop(&handle)).await {
            Ok(()) => match self.registry.set_state(vm_id, VmState::Stopped) {
                Ok(_) => {
                    info!(%vm_id, "idle vm stopped");
                    report.stopped.push(vm_id.to_string());
                }
                Err(e) => {
                    // Stays draining; the next cycle repeats the stop.
                    error!(%vm_id, error = %e, "vm stopped at provider but not in registry");
                    report.failed.push(vm_id.to_string());
                }
            },
            Err(reason) => {
                warn!(%vm_id, %reason, "stop failed, vm stays running");
                if let Err(e) = self.registry.abort_stop(vm_id) {
                    error!(%vm_id, error = %e, "could not clear draining mark");
                }
                report.failed.push(vm_id.to_string());
            }
        }
    }

    /// Terminate a `Stopped` VM. Terminating a `Terminated` VM is a no-op.
    pub async fn terminate_vm(&self, vm_id: &str) -> ReclaimResult<VmRecord> {
        let vm = self
            .registry
            .get(vm_id)?
            .ok_or_else(|| ReclaimError::NotFound(vm_id.to_string()))?;
        match vm.state {
            VmState::Terminated => return Ok(vm),
            VmState::Stopped => {}
            state => {
                return Err(ReclaimError::NotStopped {
                    vm_id: vm_id.to_string(),
                    state,
                });
            }
        }

        let handle = ProviderHandle::new(vm_id);
        self.provider_call(self.provider.terminate(&handle))
            .await
            .map_err(|reason| ReclaimError::Provider {
                vm_id: vm_id.to_string(),
                reason,
            })?;

        let vm = self.registry.set_state(vm_id, VmState::Terminated)?;
        info!(%vm_id, "stopped vm terminated");
        Ok(vm)
    }

    /// Terminate `Provisioning` records older than twice the provision
    /// timeout. No allocator waits that long, so their caller is gone.
    async fn reap_abandoned(&self, now: u64, report: &mut CycleReport) -> ReclaimResult<()> {
        let horizon = now.saturating_sub(millis(self.settings.provision_timeout).saturating_mul(2));
        for vm in self.registry.list_provisioning_before(horizon)? {
            if let Err(e) = self.registry.set_state(&vm.id, VmState::Terminated) {
                warn!(vm_id = %vm.id, error = %e, "could not reap abandoned vm");
                report.failed.push(vm.id);
                continue;
            }
            let handle = ProviderHandle::new(vm.id.as_str());
            if let Err(reason) = self.provider_call(self.provider.terminate(&handle)).await {
                warn!(vm_id = %vm.id, %reason, "abandoned vm reaped but provider release failed");
            }
            info!(vm_id = %vm.id, "abandoned provisioning vm reaped");
            report.reaped.push(vm.id);
        }
        Ok(())
    }

    /// Await a provider call bounded by `provider_call_timeout`.
    async fn provider_call<F>(&self, call: F) -> Result<(), String>
    where
        F: Future<Output = ProviderResult<()>>,
    {
        let timeout = self.settings.provider_call_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {timeout:?}")),
        }
    }

    /// Run cycles every `scan_interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.settings.scan_interval;
        info!(
            interval_secs = interval.as_secs(),
            idle_timeout_secs = self.settings.idle_timeout.as_secs(),
            "idle reclaimer started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "reclaim cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("idle reclaimer shutting down");
                    break;
                }
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
