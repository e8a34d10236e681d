//! gamegrid.toml configuration parser.

use std::borrow::Cow;
use std::path::Path;
use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};

use crate::duration::{format_duration, parse_duration};
use crate::error::{ConfigError, ConfigResult};

/// Default connect endpoint when `[streaming]` is absent.
pub const DEFAULT_ENDPOINT_TEMPLATE: &str = "https://{vm_address}/sessions/{session_id}";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridConfig {
    pub pool: Option<PoolConfig>,
    pub streaming: Option<StreamingConfig>,
    pub games: Option<Vec<GameEntry>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub scan_interval: Option<String>,
    pub idle_timeout: Option<String>,
    pub provision_timeout: Option<String>,
    pub poll_interval: Option<String>,
    pub max_poll_backoff: Option<String>,
    pub provider_call_timeout: Option<String>,
    pub allocation_retries: Option<u32>,
    pub heartbeat_interval: Option<String>,
    pub terminate_stopped_after: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamingConfig {
    pub endpoint_template: Option<String>,
}

/// A catalog entry: which capacity class sessions of this game request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEntry {
    pub id: String,
    pub name: Option<String>,
    #[serde(default = "default_sessions_per_vm")]
    pub max_sessions_per_vm: u32,
}

fn default_sessions_per_vm() -> u32 {
    1
}

/// Resolved timing and retry knobs for the allocator, tracker and reclaimer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Period of the idle reclaimer scan.
    pub scan_interval: Duration,
    /// Zero-load duration after which a VM may be stopped.
    pub idle_timeout: Duration,
    /// Upper bound on waiting for a freshly provisioned VM.
    pub provision_timeout: Duration,
    /// Base delay between provider `describe` polls.
    pub poll_interval: Duration,
    /// Cap for the exponential backoff after provider errors.
    pub max_poll_backoff: Duration,
    /// Timeout applied to each reclaimer provider call.
    pub provider_call_timeout: Duration,
    /// How many times a contended allocation is retried.
    pub allocation_retries: u32,
    /// Session heartbeat period; `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// Age after which stopped VMs are terminated; `None` leaves them alone.
    pub terminate_stopped_after: Option<Duration>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(20 * 60),
            provision_timeout: Duration::from_secs(3 * 60),
            poll_interval: Duration::from_secs(5),
            max_poll_backoff: Duration::from_secs(30),
            provider_call_timeout: Duration::from_secs(10),
            allocation_retries: 5,
            heartbeat_interval: None,
            terminate_stopped_after: None,
        }
    }
}

/// Resolved streaming settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingSettings {
    pub endpoint_template: String,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            endpoint_template: DEFAULT_ENDPOINT_TEMPLATE.to_string(),
        }
    }
}

/// Values substituted into the endpoint template.
#[derive(Debug, Clone, Copy)]
pub struct EndpointVars<'a> {
    pub vm_address: &'a str,
    pub vm_id: &'a str,
    pub game_id: &'a str,
    pub session_id: &'a str,
    pub user_id: &'a str,
}

/// Everything but RFC 3986 unreserved characters.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

impl EndpointVars<'_> {
    fn lookup(&self, name: &str) -> Option<Cow<'_, str>> {
        let value = match name {
            // Host and port; inserted verbatim.
            "vm_address" => return Some(Cow::Borrowed(self.vm_address)),
            "vm_id" => self.vm_id,
            "game_id" => self.game_id,
            "session_id" => self.session_id,
            "user_id" => self.user_id,
            _ => return None,
        };
        Some(utf8_percent_encode(value, COMPONENT).into())
    }
}

impl StreamingSettings {
    /// Build the connect URL for a session bound to a VM.
    ///
    /// Placeholders are filled in a single pass, so substituted values are
    /// never scanned again. Ids are percent-encoded; unknown `{...}` text
    /// is kept as written.
    pub fn connect_endpoint(&self, vars: EndpointVars<'_>) -> String {
        let mut out = String::with_capacity(self.endpoint_template.len() + 64);
        let mut rest = self.endpoint_template.as_str();
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let filled = tail
                .find('}')
                .and_then(|close| vars.lookup(&tail[1..close]).map(|value| (close, value)));
            match filled {
                Some((close, value)) => {
                    out.push_str(&value);
                    rest = &tail[close + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Resolve `[pool]` into typed settings, falling back to defaults.
    pub fn pool_settings(&self) -> ConfigResult<PoolSettings> {
        let defaults = PoolSettings::default();
        let Some(pool) = &self.pool else {
            return Ok(defaults);
        };

        let settings = PoolSettings {
            scan_interval: interval("scan_interval", &pool.scan_interval, defaults.scan_interval)?,
            idle_timeout: required("idle_timeout", &pool.idle_timeout, defaults.idle_timeout)?,
            provision_timeout: interval(
                "provision_timeout",
                &pool.provision_timeout,
                defaults.provision_timeout,
            )?,
            poll_interval: interval("poll_interval", &pool.poll_interval, defaults.poll_interval)?,
            max_poll_backoff: interval(
                "max_poll_backoff",
                &pool.max_poll_backoff,
                defaults.max_poll_backoff,
            )?,
            provider_call_timeout: interval(
                "provider_call_timeout",
                &pool.provider_call_timeout,
                defaults.provider_call_timeout,
            )?,
            allocation_retries: pool.allocation_retries.unwrap_or(defaults.allocation_retries),
            heartbeat_interval: optional("heartbeat_interval", &pool.heartbeat_interval)?,
            terminate_stopped_after: optional(
                "terminate_stopped_after",
                &pool.terminate_stopped_after,
            )?,
        };

        if settings.allocation_retries == 0 {
            return Err(ConfigError::Invalid(
                "allocation_retries must be at least 1".to_string(),
            ));
        }
        if settings.max_poll_backoff < settings.poll_interval {
            return Err(ConfigError::Invalid(
                "max_poll_backoff must not be shorter than poll_interval".to_string(),
            ));
        }
        Ok(settings)
    }

    pub fn streaming_settings(&self) -> StreamingSettings {
        self.streaming
            .as_ref()
            .and_then(|s| s.endpoint_template.clone())
            .map(|endpoint_template| StreamingSettings { endpoint_template })
            .unwrap_or_default()
    }

    /// Catalog entries, validated for duplicate ids and zero capacity.
    pub fn games(&self) -> ConfigResult<Vec<GameEntry>> {
        let games = self.games.clone().unwrap_or_default();
        let mut seen = std::collections::HashSet::new();
        for game in &games {
            if game.max_sessions_per_vm == 0 {
                return Err(ConfigError::Invalid(format!(
                    "game `{}`: max_sessions_per_vm must be at least 1",
                    game.id
                )));
            }
            if !seen.insert(game.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate game id `{}`", game.id)));
            }
        }
        Ok(games)
    }

    /// Scaffold a starter gamegrid.toml with the default pool settings.
    pub fn scaffold() -> Self {
        let d = PoolSettings::default();
        GridConfig {
            pool: Some(PoolConfig {
                scan_interval: Some(format_duration(d.scan_interval)),
                idle_timeout: Some(format_duration(d.idle_timeout)),
                provision_timeout: Some(format_duration(d.provision_timeout)),
                poll_interval: Some(format_duration(d.poll_interval)),
                max_poll_backoff: Some(format_duration(d.max_poll_backoff)),
                provider_call_timeout: Some(format_duration(d.provider_call_timeout)),
                allocation_retries: Some(d.allocation_retries),
                heartbeat_interval: None,
                terminate_stopped_after: None,
            }),
            streaming: Some(StreamingConfig {
                endpoint_template: Some(DEFAULT_ENDPOINT_TEMPLATE.to_string()),
            }),
            games: Some(vec![GameEntry {
                id: "sf2".to_string(),
                name: Some("Street Fighter II".to_string()),
                max_sessions_per_vm: 1,
            }]),
        }
    }
}

fn required(field: &'static str, raw: &Option<String>, default: Duration) -> ConfigResult<Duration> {
    match raw {
        Some(value) => parse_duration(value).ok_or_else(|| ConfigError::Duration {
            field,
            value: value.clone(),
        }),
        None => Ok(default),
    }
}

/// Like [`required`] but also rejects zero, for values used as sleep periods.
fn interval(field: &'static str, raw: &Option<String>, default: Duration) -> ConfigResult<Duration> {
    let d = required(field, raw, default)?;
    if d.is_zero() {
        return Err(ConfigError::Invalid(format!("{field} must be non-zero")));
    }
    Ok(d)
}

fn optional(field: &'static str, raw: &Option<String>) -> ConfigResult<Option<Duration>> {
    raw.as_ref()
        .map(|value| {
            parse_duration(value)
                .filter(|d| !d.is_zero())
                .ok_or_else(|| ConfigError::Duration {
                    field,
                    value: value.clone(),
                })
        })
        .transpose()
}
