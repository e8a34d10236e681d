//! Error types for the GameGrid registry.

use thiserror::Error;

use crate::types::VmState;

/// Result type alias for registry operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("vm {vm_id}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        vm_id: String,
        from: VmState,
        to: VmState,
    },

    #[error("vm {vm_id}: cannot leave service with {load} active sessions")]
    LoadNotZero { vm_id: String, load: u32 },

    #[error("vm {0}: load decrement below zero")]
    NegativeLoad(String),
}

impl StateError {
    /// Whether this error means a registry invariant was about to break.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            StateError::NegativeLoad(_) | StateError::LoadNotZero { .. }
        )
    }
}
