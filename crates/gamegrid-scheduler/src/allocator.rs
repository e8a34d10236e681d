//! VM allocator: claims a slot on a running VM or provisions a new one.
//!
//! Reuse is always tried first: the fullest eligible VM of the requested
//! capacity class wins, so load consolidates and idle VMs drain toward the
//! reclaimer. Only when no VM is eligible does the allocator ask the
//! provider for a fresh instance and wait for it to boot.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use gamegrid_core::PoolSettings;
use gamegrid_provider::{BootState, ProviderHandle, ProviderResult, ResourceProvider};
use gamegrid_state::{LoadOutcome, Registry, VmRecord, VmState};

use crate::backoff::Backoff;
use crate::error::{OrchestratorError, OrchestratorResult};

/// A claimed session slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The VM after the claim; `load` includes the caller's slot.
    pub vm: VmRecord,
    /// Whether the VM was provisioned for this request.
    pub provisioned: bool,
}

pub struct Allocator {
    registry: Registry,
    provider: Arc<dyn ResourceProvider>,
    settings: PoolSettings,
}

impl Allocator {
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

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Claim one slot of `capacity_class`.
    ///
    /// On success the returned VM is `Running` with an address, and its
    /// load already counts the caller.
    pub async fn allocate(&self, capacity_class: u32) -> OrchestratorResult<Allocation> {
        if capacity_class == 0 {
            return Err(OrchestratorError::InvalidRequest(
                "capacity class must be positive".into(),
            ));
        }

        if let Some(vm) = self.claim_existing(capacity_class)? {
            return Ok(Allocation {
                vm,
                provisioned: false,
            });
        }

        let vm = self.provision(capacity_class).await?;
        Ok(Allocation {
            vm,
            provisioned: true,
        })
    }

    /// Claim a slot on the fullest eligible VM.
    ///
    /// Returns `Ok(None)` when no VM is eligible. A claim that loses a race
    /// (the VM filled up or started draining after it was picked) is retried
    /// against a fresh pick, up to `allocation_retries` times.
    pub fn claim_existing(&self, capacity_class: u32) -> OrchestratorResult<Option<VmRecord>> {
        let attempts = self.settings.allocation_retries;
        for attempt in 1..=attempts {
            let Some(candidate) = self.registry.find_eligible(capacity_class)? else {
                return Ok(None);
            };
            match self.registry.increment_load(&candidate.id)? {
                LoadOutcome::Claimed(vm) => {
                    debug!(vm_id = %vm.id, load = vm.load, attempt, "reusing running vm");
                    return Ok(Some(vm));
                }
                LoadOutcome::Full | LoadOutcome::NotFound => {
                    debug!(vm_id = %candidate.id, attempt, "lost slot race, retrying");
                }
            }
        }

        warn!(capacity_class, attempts, "allocation contention");
        Err(OrchestratorError::AllocationContention {
            capacity_class,
            attempts,
        })
    }

    /// Provision a VM and wait for it to report ready with an address.
    ///
    /// The whole sequence is bounded by `provision_timeout`. A VM that
    /// errors or misses the deadline is marked `Terminated` and released at
    /// the provider; no session is ever bound to it.
    async fn provision(&self, capacity_class: u32) -> OrchestratorResult<VmRecord> {
        let timeout = self.settings.provision_timeout;
        let deadline = far_deadline(timeout);
        info!(capacity_class, "no eligible vm, provisioning");

        let Some(handle) = self.request_instance(capacity_class, deadline).await else {
            warn!(capacity_class, ?timeout, "no instance obtained before deadline");
            return Err(OrchestratorError::ProvisioningTimeout {
                vm_id: None,
                timeout,
            });
        };
        let vm_id = handle.as_str();

        if let Err(e) = self.registry.create(vm_id, capacity_class) {
            error!(%vm_id, error = %e, "could not record provisioned vm");
            self.release_instance(&handle).await;
            return Err(e.into());
        }

        match tokio::time::timeout_at(deadline, self.await_ready(&handle)).await {
            Ok(Ok(address)) => match self.registry.activate(vm_id, &address) {
                Ok(vm) => Ok(vm),
                Err(e) => {
                    warn!(%vm_id, error = %e, "vm ready but could not be activated");
                    self.abandon(&handle).await;
                    Err(e.into())
                }
            },
            Ok(Err(reason)) => {
                warn!(%vm_id, %reason, "vm failed to boot");
                self.abandon(&handle).await;
                Err(OrchestratorError::ProviderUnavailable(format!(
                    "vm {vm_id} failed to boot: {reason}"
                )))
            }
            Err(_) => {
                warn!(%vm_id, ?timeout, "vm not ready before deadline");
                self.abandon(&handle).await;
                Err(OrchestratorError::ProvisioningTimeout {
                    vm_id: Some(vm_id.to_string()),
                    timeout,
                })
            }
        }
    }

    /// Ask the provider for an instance until it accepts or `deadline` passes.
    ///
    /// Each provision call runs as its own task. A call still in flight at
    /// the deadline is handed to [`release_late_instance`] instead of being
    /// dropped, so an instance the provider creates afterwards is terminated
    /// rather than left running with no registry record.
    async fn request_instance(
        &self,
        capacity_class: u32,
        deadline: Instant,
    ) -> Option<ProviderHandle> {
        let mut backoff = Backoff::new(self.settings.poll_interval, self.settings.max_poll_backoff);
        loop {
            let provider = self.provider.clone();
            let mut call = tokio::spawn(async move { provider.provision(capacity_class).await });

            match tokio::time::timeout_at(deadline, &mut call).await {
                Ok(Ok(Ok(handle))) => {
                    debug!(vm_id = %handle, capacity_class, "provision accepted");
                    return Some(handle);
                }
                Ok(Ok(Err(e))) => {
                    warn!(capacity_class, error = %e, "provision request failed");
                    backoff.record_failure();
                }
                Ok(Err(e)) => {
                    warn!(capacity_class, error = %e, "provision task failed");
                    backoff.record_failure();
                }
                Err(_) => {
                    warn!(capacity_class, "provision call still in flight at deadline");
                    tokio::spawn(release_late_instance(
                        self.provider.clone(),
                        call,
                        self.settings.provider_call_timeout,
                    ));
                    return None;
                }
            }

            let pause = tokio::time::sleep(backoff.next_interval());
            if tokio::time::timeout_at(deadline, pause).await.is_err() {
                return None;
            }
        }
    }

    /// Poll `describe` until the instance is ready with an address.
    ///
    /// Returns `Err` with a reason when the provider reports a boot error.
    async fn await_ready(&self, handle: &ProviderHandle) -> Result<String, String> {
        let mut backoff = Backoff::new(self.settings.poll_interval, self.settings.max_poll_backoff);
        loop {
            match self.provider.describe(handle).await {
                Ok(desc) => match (desc.state, desc.address) {
                    (BootState::Ready, Some(address)) => return Ok(address),
                    (BootState::Ready, None) => {
                        debug!(vm_id = %handle, "ready without address, polling again");
                        backoff.record_success();
                    }
                    (BootState::Booting, _) => backoff.record_success(),
                    (BootState::Error, _) => return Err("provider reported boot error".into()),
                },
                Err(e) => {
                    warn!(vm_id = %handle, error = %e, "describe failed");
                    backoff.record_failure();
                }
            }
            tokio::time::sleep(backoff.next_interval()).await;
        }
    }

    /// Mark a never-activated VM terminated and release it at the provider.
    async fn abandon(&self, handle: &ProviderHandle) {
        if let Err(e) = self.registry.set_state(handle.as_str(), VmState::Terminated) {
            error!(vm_id = %handle, error = %e, "could not mark abandoned vm terminated");
        }
        self.release_instance(handle).await;
    }

    /// Best-effort provider terminate, bounded by `provider_call_timeout`.
    async fn release_instance(&self, handle: &ProviderHandle) {
        terminate_bounded(
            self.provider.as_ref(),
            handle,
            self.settings.provider_call_timeout,
        )
        .await;
    }
}

/// `now + timeout`, clamped for timeouts too large to represent.
fn far_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

/// Wait out a provision call abandoned at the deadline and terminate
/// whatever instance it produces.
async fn release_late_instance(
    provider: Arc<dyn ResourceProvider>,
    call: JoinHandle<ProviderResult<ProviderHandle>>,
    call_timeout: Duration,
) {
    match call.await {
        Ok(Ok(handle)) => {
            warn!(vm_id = %handle, "instance created after provisioning deadline, releasing");
            terminate_bounded(provider.as_ref(), &handle, call_timeout).await;
        }
        Ok(Err(e)) => debug!(error = %e, "late provision call failed, nothing to release"),
        Err(e) => warn!(error = %e, "late provision task failed"),
    }
}

async fn terminate_bounded(
    provider: &dyn ResourceProvider,
    handle: &ProviderHandle,
    call_timeout: Duration,
) {
    match tokio::time::timeout(call_timeout, provider.terminate(handle)).await {
        Ok(Ok(())) => info!(vm_id = %handle, "abandoned vm terminated at provider"),
        Ok(Err(e)) => warn!(vm_id = %handle, error = %e, "provider terminate failed"),
        Err(_) => warn!(vm_id = %handle, "provider terminate timed out"),
    }
}

#[cfg(test)]
mod tests {
    use gamegrid_provider::SimulatedProvider;

    use super::*;

    fn fast_settings() -> PoolSettings {
        PoolSettings {
            provision_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
            max_poll_backoff: Duration::from_millis(20),
            provider_call_timeout: Duration::from_millis(200),
            ..PoolSettings::default()
        }
    }

    fn setup(provider: SimulatedProvider) -> (Registry, Arc<SimulatedProvider>, Allocator) {
        setup_with(provider, fast_settings())
    }

    fn setup_with(
        provider: SimulatedProvider,
        settings: PoolSettings,
    ) -> (Registry, Arc<SimulatedProvider>, Allocator) {
        let registry = Registry::open_in_memory().unwrap();
        let provider = Arc::new(provider);
        let allocator = Allocator::new(registry.clone(), provider.clone(), settings);
        (registry, provider, allocator)
    }

    fn running(registry: &Registry, id: &str, capacity: u32, load: u32) {
        registry.create(id, capacity).unwrap();
        registry.activate(id, "10.9.9.9").unwrap();
        for _ in 1..load {
            registry.increment_load(id).unwrap();
        }
        if load == 0 {
            registry.decrement_load(id).unwrap();
        }
    }

    #[tokio::test]
    async fn provisions_when_pool_is_empty() {
        let (registry, provider, allocator) = setup(SimulatedProvider::new().with_boot_polls(2));

        let allocation = allocator.allocate(1).await.unwrap();
        assert!(allocation.provisioned);
        assert_eq!(allocation.vm.state, VmState::Running);
        assert_eq!(allocation.vm.load, 1);
        assert!(allocation.vm.address.is_some());
        assert_eq!(provider.provision_calls(), 1);
        assert_eq!(registry.list_vms().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reuses_running_vm_with_spare_capacity() {
        let (registry, provider, allocator) = setup(SimulatedProvider::new());
        running(&registry, "i-a", 2, 1);

        let allocation = allocator.allocate(2).await.unwrap();
        assert!(!allocation.provisioned);
        assert_eq!(allocation.vm.id, "i-a");
        assert_eq!(allocation.vm.load, 2);
        assert_eq!(provider.provision_calls(), 0);
    }

    #[tokio::test]
    async fn prefers_the_fullest_vm() {
        let (registry, _provider, allocator) = setup(SimulatedProvider::new());
        running(&registry, "i-a", 4, 1);
        running(&registry, "i-b", 4, 3);
        running(&registry, "i-c", 4, 0);

        let allocation = allocator.allocate(4).await.unwrap();
        assert_eq!(allocation.vm.id, "i-b");
        assert_eq!(allocation.vm.load, 4);
    }

    #[tokio::test]
    async fn other_capacity_classes_are_not_shared() {
        let (registry, provider, allocator) = setup(SimulatedProvider::new());
        running(&registry, "i-a", 2, 0);

        let allocation = allocator.allocate(1).await.unwrap();
        assert!(allocation.provisioned);
        assert_eq!(allocation.vm.capacity, 1);
        assert_eq!(provider.provision_calls(), 1);
        assert_eq!(registry.get("i-a").unwrap().unwrap().load, 0);
    }

    #[tokio::test]
    async fn draining_and_full_vms_are_skipped() {
        let (registry, provider, allocator) = setup(SimulatedProvider::new());
        running(&registry, "i-full", 1, 1);
        running(&registry, "i-drain", 1, 0);
        assert!(matches!(
            registry.begin_stop("i-drain", u64::MAX).unwrap(),
            gamegrid_state::StopGate::Draining(_)
        ));

        let allocation = allocator.allocate(1).await.unwrap();
        assert!(allocation.provisioned);
        assert_eq!(provider.provision_calls(), 1);
    }

    #[tokio::test]
    async fn zero_capacity_class_is_rejected() {
        let (_registry, provider, allocator) = setup(SimulatedProvider::new());
        assert!(matches!(
            allocator.allocate(0).await,
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert_eq!(provider.provision_calls(), 0);
    }

    #[tokio::test]
    async fn boot_timeout_terminates_the_vm() {
        let settings = PoolSettings {
            provision_timeout: Duration::from_millis(60),
            ..fast_settings()
        };
        let (registry, provider, allocator) =
            setup_with(SimulatedProvider::new().never_ready(), settings);

        let vm_id = match allocator.allocate(1).await {
            Err(OrchestratorError::ProvisioningTimeout { vm_id: Some(vm_id), .. }) => vm_id,
            other => panic!("expected provisioning timeout, got {other:?}"),
        };

        let vm = registry.get(&vm_id).unwrap().unwrap();
        assert_eq!(vm.state, VmState::Terminated);
        assert_eq!(vm.load, 0);
        assert_eq!(provider.terminated().await, vec![ProviderHandle::new(vm_id)]);
    }

    #[tokio::test]
    async fn boot_error_terminates_the_vm() {
        let (registry, provider, allocator) = setup(SimulatedProvider::new().failing_boot());

        let err = allocator.allocate(1).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ProviderUnavailable(_)));

        let vms = registry.list_vms().unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].state, VmState::Terminated);
        assert_eq!(provider.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn transient_provider_errors_are_retried() {
        let (_registry, provider, allocator) = setup(SimulatedProvider::new());
        provider.fail_next_provisions(2).await;
        provider.fail_next_describes(2).await;

        let allocation = allocator.allocate(1).await.unwrap();
        assert!(allocation.provisioned);
        assert_eq!(provider.provision_calls(), 3);
        assert_eq!(provider.describe_calls(), 3);
    }

    #[tokio::test]
    async fn unreachable_provider_leaves_no_record() {
        let settings = PoolSettings {
            provision_timeout: Duration::from_millis(60),
            ..fast_settings()
        };
        let (registry, provider, allocator) = setup_with(SimulatedProvider::new(), settings);
        provider.fail_next_provisions(u32::MAX).await;

        let err = allocator.allocate(1).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::ProvisioningTimeout { vm_id: None, .. }
        ));
        assert!(registry.list_vms().unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_provision_call_times_out_and_late_instance_is_released() {
        let settings = PoolSettings {
            provision_timeout: Duration::from_millis(50),
            ..fast_settings()
        };
        let (registry, provider, allocator) = setup_with(
            SimulatedProvider::new().with_provision_delay(Duration::from_millis(150)),
            settings,
        );

        let err = allocator.allocate(1).await.unwrap_err();
        assert!(
            matches!(err, OrchestratorError::ProvisioningTimeout { vm_id: None, .. }),
            "got {err:?}"
        );
        assert!(registry.list_vms().unwrap().is_empty());
        assert_eq!(provider.provision_calls(), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(provider.instance_count().await, 1);
        assert_eq!(provider.terminate_calls(), 1);
        assert_eq!(provider.terminated().await.len(), 1);
        assert!(registry.list_vms().unwrap().is_empty());
    }

    #[test]
    fn oversized_timeout_still_yields_a_deadline() {
        assert!(far_deadline(Duration::MAX) > Instant::now());
    }

    #[tokio::test]
    async fn waits_for_address_after_ready() {
        let (_registry, _provider, allocator) = setup(SimulatedProvider::new().with_address_lag(2));

        let allocation = allocator.allocate(1).await.unwrap();
        assert!(allocation.vm.address.is_some());
    }
}
