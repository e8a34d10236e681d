//! gamegrid-reclaim: periodic idle VM reclamation.
//!
//! Every `scan_interval` the reclaimer lists `Running` VMs with no sessions
//! and no activity for `idle_timeout`, re-checks each one under a registry
//! transaction (marking it draining so no session can land on it), stops it
//! at the provider, and records it as `Stopped`. A failed or slow stop
//! leaves the VM `Running` for the next cycle.
//!
//! The same cycle optionally terminates VMs that have stayed `Stopped`
//! past `terminate_stopped_after`, and reaps `Provisioning` records whose
//! allocation was abandoned mid-boot.

pub mod error;
pub mod reclaimer;

pub use error::{ReclaimError, ReclaimResult};
pub use reclaimer::{CycleReport, IdleReclaimer};
