//! gamegrid-scheduler: VM allocation and session binding.
//!
//! Places user sessions onto VMs from the pool. The allocator reuses the
//! fullest running VM of the requested capacity class and provisions a new
//! one only when none has room. The binder turns an allocation into a
//! session record with a connect endpoint, and releases the slot again when
//! the session ends.
//!
//! # Architecture
//!
//! ```text
//! SessionBinder
//!   ├── GameCatalog (game → capacity class)
//!   ├── Allocator
//!   │   ├── Registry (find_eligible / increment_load, retried on contention)
//!   │   └── ResourceProvider (provision, describe with backoff, terminate)
//!   ├── Registry (open_session / close_session)
//!   └── ActivityTracker (touch, per-session heartbeat)
//! ```

pub mod allocator;
pub mod backoff;
pub mod binder;
pub mod catalog;
pub mod error;

pub use allocator::{Allocation, Allocator};
pub use backoff::Backoff;
pub use binder::{SessionBinder, SessionStatus, SessionTicket};
pub use catalog::{GameCatalog, StaticCatalog};
pub use error::{OrchestratorError, OrchestratorResult};
