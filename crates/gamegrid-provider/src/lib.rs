//! gamegrid-provider: the compute backend behind the VM pool.
//!
//! The orchestrator never talks to a cloud API directly. It goes through
//! the [`ResourceProvider`] trait, whose four calls (`provision`,
//! `describe`, `stop`, `terminate`) are all assumed slow and flaky:
//! callers wrap them in their own timeouts and retry policies. The only
//! provider-side guarantee relied upon is that stopping or terminating
//! twice is harmless.
//!
//! [`SimulatedProvider`] is an in-memory backend with scriptable boot
//! latency and failures, used by tests and by the daemon's local mode.

pub mod error;
pub mod provider;
pub mod simulated;

pub use error::{ProviderError, ProviderResult};
pub use provider::{BootState, Description, ProviderHandle, ResourceProvider};
pub use simulated::{InstanceStatus, SimulatedProvider};
