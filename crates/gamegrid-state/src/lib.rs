//! gamegrid-state: the VM registry for GameGrid.
//!
//! Backed by [redb](https://docs.rs/redb). The [`Registry`] is the single
//! owner of VM records (capacity, load, lifecycle state, last activity)
//! and of session history. Every other component reads and mutates VMs
//! through its methods.
//!
//! # Consistency
//!
//! redb admits one write transaction at a time. Each registry mutation
//! performs its read-check-write inside a single write transaction, so
//! mutations of the same VM are linearizable: two concurrent
//! `increment_load` calls can never both succeed past capacity, and a
//! reclaimer stop can never interleave with a slot claim.
//!
//! Records are never physically deleted. VMs end in `Terminated`,
//! sessions keep their `ended_at` stamp.
//!
//! The `Registry` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod registry;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::{Registry, epoch_millis};
pub use types::*;
