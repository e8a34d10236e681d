//! In-memory provider with scriptable latency and failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{BootState, Description, ProviderHandle, ResourceProvider};

/// Lifecycle of a simulated instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Booting,
    Ready,
    Stopped,
    Terminated,
}

#[derive(Debug)]
struct SimInstance {
    status: InstanceStatus,
    describes: u32,
    address: String,
}

#[derive(Debug, Default)]
struct Script {
    /// Describe calls before an instance reports `Ready`.
    boot_polls: u32,
    /// Describe calls after `Ready` during which the address is withheld.
    address_lag: u32,
    never_ready: bool,
    boot_error: bool,
    fail_provisions: u32,
    fail_describes: u32,
    fail_stops: bool,
    provision_delay: Duration,
    stop_delay: Duration,
}

/// A [`ResourceProvider`] that keeps instances in memory.
///
/// Instance ids are `i-<16 hex digits>` drawn from a counter, so they are
/// never reused within one provider.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    next_id: AtomicU64,
    instances: Mutex<HashMap<String, SimInstance>>,
    script: Mutex<Script>,
    stopped: Mutex<Vec<ProviderHandle>>,
    terminated: Mutex<Vec<ProviderHandle>>,
    provision_calls: AtomicU32,
    describe_calls: AtomicU32,
    stop_calls: AtomicU32,
    terminate_calls: AtomicU32,
}

impl SimulatedProvider {
    /// A provider whose instances are ready on the first `describe`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Booting` for the first `polls` describe calls of each instance.
    pub fn with_boot_polls(mut self, polls: u32) -> Self {
        self.script.get_mut().boot_polls = polls;
        self
    }

    /// Sleep this long inside every `provision` call.
    pub fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.script.get_mut().provision_delay = delay;
        self
    }

    /// Instances never leave `Booting`.
    pub fn never_ready(mut self) -> Self {
        self.script.get_mut().never_ready = true;
        self
    }

    /// Instances report `Error` instead of becoming ready.
    pub fn failing_boot(mut self) -> Self {
        self.script.get_mut().boot_error = true;
        self
    }

    /// Withhold the address for `polls` describe calls after `Ready`.
    pub fn with_address_lag(mut self, polls: u32) -> Self {
        self.script.get_mut().address_lag = polls;
        self
    }

    /// Register an instance created by an earlier provider process.
    ///
    /// A restarted daemon uses this to hand its persisted VMs back to a
    /// fresh provider, so stops and terminates on them succeed. An
    /// `i-<hex>` id also moves the id counter past it, so newly provisioned
    /// ids never collide with persisted ones.
    pub fn with_existing_instance(
        mut self,
        id: &str,
        address: Option<&str>,
        status: InstanceStatus,
    ) -> Self {
        let n = id
            .strip_prefix("i-")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok());
        if let Some(n) = n {
            let next = self.next_id.get_mut();
            *next = (*next).max(n);
        }
        let address = match (address, n) {
            (Some(address), _) => address.to_string(),
            (None, Some(n)) => instance_address(n),
            (None, None) => "10.0.255.255".to_string(),
        };
        self.instances.get_mut().insert(
            id.to_string(),
            SimInstance {
                status,
                // Already past any scripted boot or address lag.
                describes: u32::MAX,
                address,
            },
        );
        self
    }

    /// Make the next `n` provision calls fail.
    pub async fn fail_next_provisions(&self, n: u32) {
        self.script.lock().await.fail_provisions = n;
    }

    /// Make the next `n` describe calls fail.
    pub async fn fail_next_describes(&self, n: u32) {
        self.script.lock().await.fail_describes = n;
    }

    /// Make every stop call fail until reset.
    pub async fn set_fail_stops(&self, fail: bool) {
        self.script.lock().await.fail_stops = fail;
    }

    /// Sleep this long inside every `stop` call.
    pub async fn set_stop_delay(&self, delay: Duration) {
        self.script.lock().await.stop_delay = delay;
    }

    /// Handles passed to successful `stop` calls, in order.
    pub async fn stopped(&self) -> Vec<ProviderHandle> {
        self.stopped.lock().await.clone()
    }

    /// Handles passed to successful `terminate` calls, in order.
    pub async fn terminated(&self) -> Vec<ProviderHandle> {
        self.terminated.lock().await.clone()
    }

    /// Number of instances ever provisioned.
    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    pub fn provision_calls(&self) -> u32 {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> u32 {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u32 {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

fn instance_address(n: u64) -> String {
    format!("10.0.{}.{}", (n >> 8) & 0xff, n & 0xff)
}

#[async_trait]
impl ResourceProvider for SimulatedProvider {
    async fn provision(&self, capacity_class: u32) -> ProviderResult<ProviderHandle> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut script = self.script.lock().await;
            if script.fail_provisions > 0 {
                script.fail_provisions -= 1;
                return Err(ProviderError::Unavailable("simulated provision failure".into()));
            }
            script.provision_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("i-{n:016x}");
        let address = instance_address(n);
        self.instances.lock().await.insert(
            id.clone(),
            SimInstance {
                status: InstanceStatus::Booting,
                describes: 0,
                address,
            },
        );
        debug!(instance = %id, capacity_class, "simulated instance provisioned");
        Ok(ProviderHandle(id))
    }

    async fn describe(&self, handle: &ProviderHandle) -> ProviderResult<Description> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        let (boot_polls, address_lag, never_ready, boot_error) = {
            let mut script = self.script.lock().await;
            if script.fail_describes > 0 {
                script.fail_describes -= 1;
                return Err(ProviderError::Unavailable("simulated describe failure".into()));
            }
            (
                script.boot_polls,
                script.address_lag,
                script.never_ready,
                script.boot_error,
            )
        };

        let mut instances = self.instances.lock().await;
        let inst = instances
            .get_mut(handle.as_str())
            .ok_or_else(|| ProviderError::UnknownInstance(handle.to_string()))?;
        inst.describes = inst.describes.saturating_add(1);

        if inst.status == InstanceStatus::Booting
            && !never_ready
            && !boot_error
            && inst.describes > boot_polls
        {
            inst.status = InstanceStatus::Ready;
        }
        let description = match inst.status {
            InstanceStatus::Booting if boot_error => Description {
                state: BootState::Error,
                address: None,
            },
            InstanceStatus::Booting => Description {
                state: BootState::Booting,
                address: None,
            },
            InstanceStatus::Ready => Description {
                state: BootState::Ready,
                address: (inst.describes > boot_polls + address_lag)
                    .then(|| inst.address.clone()),
            },
            InstanceStatus::Stopped | InstanceStatus::Terminated => Description {
                state: BootState::Error,
                address: None,
            },
        };
        Ok(description)
    }

    async fn stop(&self, handle: &ProviderHandle) -> ProviderResult<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let (fail, delay) = {
            let script = self.script.lock().await;
            (script.fail_stops, script.stop_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ProviderError::Unavailable("simulated stop failure".into()));
        }

        let mut instances = self.instances.lock().await;
        let inst = instances
            .get_mut(handle.as_str())
            .ok_or_else(|| ProviderError::UnknownInstance(handle.to_string()))?;
        if inst.status != InstanceStatus::Terminated {
            inst.status = InstanceStatus::Stopped;
        }
        drop(instances);

        self.stopped.lock().await.push(handle.clone());
        Ok(())
    }

    async fn terminate(&self, handle: &ProviderHandle) -> ProviderResult<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        let mut instances = self.instances.lock().await;
        let inst = instances
            .get_mut(handle.as_str())
            .ok_or_else(|| ProviderError::UnknownInstance(handle.to_string()))?;
        inst.status = InstanceStatus::Terminated;
        drop(instances);

        self.terminated.lock().await.push(handle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_on_first_describe_by_default() {
        let provider = SimulatedProvider::new();
        let handle = provider.provision(1).await.unwrap();

        let desc = provider.describe(&handle).await.unwrap();
        assert_eq!(desc.state, BootState::Ready);
        assert!(desc.address.is_some());
    }

    #[tokio::test]
    async fn boots_after_configured_polls() {
        let provider = SimulatedProvider::new().with_boot_polls(2);
        let handle = provider.provision(1).await.unwrap();

        assert_eq!(provider.describe(&handle).await.unwrap().state, BootState::Booting);
        assert_eq!(provider.describe(&handle).await.unwrap().state, BootState::Booting);
        assert_eq!(provider.describe(&handle).await.unwrap().state, BootState::Ready);
        assert_eq!(provider.describe_calls(), 3);
    }

    #[tokio::test]
    async fn address_can_lag_behind_ready() {
        let provider = SimulatedProvider::new().with_address_lag(1);
        let handle = provider.provision(1).await.unwrap();

        let first = provider.describe(&handle).await.unwrap();
        assert_eq!(first.state, BootState::Ready);
        assert_eq!(first.address, None);
        assert!(provider.describe(&handle).await.unwrap().address.is_some());
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let provider = SimulatedProvider::new();
        let a = provider.provision(1).await.unwrap();
        let b = provider.provision(1).await.unwrap();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("i-"));
        assert_eq!(provider.instance_count().await, 2);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let provider = SimulatedProvider::new();
        provider.fail_next_provisions(1).await;
        assert!(provider.provision(1).await.is_err());
        let handle = provider.provision(1).await.unwrap();

        provider.fail_next_describes(2).await;
        assert!(provider.describe(&handle).await.is_err());
        assert!(provider.describe(&handle).await.is_err());
        assert!(provider.describe(&handle).await.is_ok());
    }

    #[tokio::test]
    async fn never_ready_and_failing_boot() {
        let stuck = SimulatedProvider::new().never_ready();
        let handle = stuck.provision(1).await.unwrap();
        for _ in 0..5 {
            assert_eq!(stuck.describe(&handle).await.unwrap().state, BootState::Booting);
        }

        let broken = SimulatedProvider::new().failing_boot();
        let handle = broken.provision(1).await.unwrap();
        assert_eq!(broken.describe(&handle).await.unwrap().state, BootState::Error);
    }

    #[tokio::test]
    async fn stop_and_terminate_are_repeatable() {
        let provider = SimulatedProvider::new();
        let handle = provider.provision(1).await.unwrap();

        provider.stop(&handle).await.unwrap();
        provider.stop(&handle).await.unwrap();
        provider.terminate(&handle).await.unwrap();
        provider.terminate(&handle).await.unwrap();

        assert_eq!(provider.stopped().await.len(), 2);
        assert_eq!(provider.terminated().await, vec![handle.clone(), handle]);
    }

    #[tokio::test]
    async fn stop_failures_until_reset() {
        let provider = SimulatedProvider::new();
        let handle = provider.provision(1).await.unwrap();

        provider.set_fail_stops(true).await;
        assert!(provider.stop(&handle).await.is_err());
        provider.set_fail_stops(false).await;
        assert!(provider.stop(&handle).await.is_ok());
        assert_eq!(provider.stop_calls(), 2);
        assert_eq!(provider.stopped().await.len(), 1);
    }

    #[tokio::test]
    async fn existing_instances_are_adopted() {
        let provider = SimulatedProvider::new()
            .with_boot_polls(3)
            .with_existing_instance("i-0000000000000002", Some("10.0.0.2"), InstanceStatus::Ready)
            .with_existing_instance("i-0000000000000005", None, InstanceStatus::Stopped);

        let running = ProviderHandle::new("i-0000000000000002");
        let desc = provider.describe(&running).await.unwrap();
        assert_eq!(desc.state, BootState::Ready);
        assert_eq!(desc.address.as_deref(), Some("10.0.0.2"));
        provider.stop(&running).await.unwrap();
        provider
            .terminate(&ProviderHandle::new("i-0000000000000005"))
            .await
            .unwrap();

        let fresh = provider.provision(1).await.unwrap();
        assert_eq!(fresh.as_str(), "i-0000000000000006");
        assert_eq!(provider.instance_count().await, 3);
    }

    #[tokio::test]
    async fn unknown_handle_is_an_error() {
        let provider = SimulatedProvider::new();
        let ghost = ProviderHandle::new("i-ghost");
        assert!(matches!(
            provider.describe(&ghost).await,
            Err(ProviderError::UnknownInstance(_))
        ));
        assert!(provider.stop(&ghost).await.is_err());
    }
}
