//! The provider contract consumed by the allocator and reclaimer.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderResult;

/// Provider-assigned instance identifier, used as the VM id in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderHandle(pub String);

impl ProviderHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Boot progress as reported by `describe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    Booting,
    Ready,
    Error,
}

/// A provider's view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    pub state: BootState,
    /// Network address; may lag behind `Ready`.
    pub address: Option<String>,
}

/// External compute API used to create, inspect, stop and terminate VMs.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Start creating an instance sized for `capacity_class` sessions.
    ///
    /// Returns as soon as the provider has assigned an id; readiness is
    /// observed through [`describe`](Self::describe).
    async fn provision(&self, capacity_class: u32) -> ProviderResult<ProviderHandle>;

    async fn describe(&self, handle: &ProviderHandle) -> ProviderResult<Description>;

    /// Stop the instance. Stopping twice must be harmless.
    async fn stop(&self, handle: &ProviderHandle) -> ProviderResult<()>;

    /// Release the instance for good. Terminating twice must be harmless.
    async fn terminate(&self, handle: &ProviderHandle) -> ProviderResult<()>;
}
