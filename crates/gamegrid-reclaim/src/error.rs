//! Reclaimer error types.

use thiserror::Error;

use gamegrid_state::{StateError, VmState};

#[derive(Debug, Error)]
pub enum ReclaimError {
    #[error("vm not found: {0}")]
    NotFound(String),

    #[error("vm {vm_id} is {state:?}, only stopped vms can be terminated")]
    NotStopped { vm_id: String, state: VmState },

    #[error("provider call for vm {vm_id} failed: {reason}")]
    Provider { vm_id: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type ReclaimResult<T> = Result<T, ReclaimError>;
