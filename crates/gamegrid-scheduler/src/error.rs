//! Scheduler error types.

use std::time::Duration;

use thiserror::Error;
use tracing::error;

use gamegrid_provider::ProviderError;
use gamegrid_state::StateError;

/// Errors surfaced by allocation and session operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("session {0} belongs to another user")]
    Forbidden(String),

    #[error("capacity class {capacity_class}: no slot claimed after {attempts} attempts")]
    AllocationContention { capacity_class: u32, attempts: u32 },

    /// `vm_id` is `None` when the provider never assigned an instance.
    #[error(
        "provisioning not finished within {timeout:?} (vm {})",
        .vm_id.as_deref().unwrap_or("unassigned")
    )]
    ProvisioningTimeout {
        vm_id: Option<String>,
        timeout: Duration,
    },

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for OrchestratorError {
    fn from(e: StateError) -> Self {
        if e.is_invariant_violation() {
            error!(error = %e, "registry invariant violation");
            OrchestratorError::InvariantViolation(e.to_string())
        } else {
            OrchestratorError::State(e)
        }
    }
}

impl From<ProviderError> for OrchestratorError {
    fn from(e: ProviderError) -> Self {
        OrchestratorError::ProviderUnavailable(e.to_string())
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
