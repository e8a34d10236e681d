//! Provider error types.

use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors returned by a [`ResourceProvider`](crate::ResourceProvider).
///
/// The orchestrator treats every variant as retryable within its own
/// bounds; the distinction only feeds logging.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}
