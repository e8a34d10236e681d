//! Configuration error types.

use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading or resolving `gamegrid.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}
