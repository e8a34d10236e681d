//! gamegrid-core: configuration shared by every GameGrid crate.
//!
//! `gamegrid.toml` is parsed into a raw [`GridConfig`] (every field
//! optional) and then resolved into typed values: [`PoolSettings`] for the
//! allocator/reclaimer, [`StreamingSettings`] for connect endpoints, and a
//! list of [`GameEntry`] for the static catalog. The resolved values are
//! passed into constructors explicitly; nothing here is process-global.

pub mod config;
pub mod duration;
pub mod error;

pub use config::{EndpointVars, GameEntry, GridConfig, PoolSettings, StreamingSettings};
pub use duration::{format_duration, parse_duration};
pub use error::{ConfigError, ConfigResult};
