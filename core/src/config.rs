//! Runtime configuration: defaults, optional TOML overlay, env overrides.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Result, WeftError};

/// Top-level configuration shared by every endpoint of a host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub ipc: IpcConfig,
    pub channel: ChannelConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Capacity of each endpoint's inbound envelope queue
    pub inbox_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Interval between method-type requests while a sender handshake is incomplete
    pub handshake_retry_ms: u64,
    /// Calls buffered per sender while its receiver is disabled
    pub call_buffer_limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_listeners_per_type: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_retry_ms: 250,
            call_buffer_limit: 1024,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_listeners_per_type: 256,
        }
    }
}

impl WeftConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Loads `path` over the defaults, then applies env overrides.
    ///
    /// A missing file is not an error; an unreadable or invalid one is logged
    /// and the defaults are used.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let base = if !path.exists() {
            info!(target: "config", path = %path.display(), "No config file found; using defaults/env");
            Self::default()
        } else {
            match fs::read_to_string(path) {
                Ok(s) => Self::from_toml_str(&s).unwrap_or_else(|e| {
                    warn!(target: "config", path = %path.display(), error = %e, "Failed to parse config; using defaults");
                    Self::default()
                }),
                Err(e) => {
                    warn!(target: "config", path = %path.display(), error = %e, "Failed to read config; using defaults");
                    Self::default()
                }
            }
        };
        base.apply_env_overrides()
    }

    /// Overrides fields from `WEFT_*` environment variables when set and parseable.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse::<usize>("WEFT_INBOX_CAPACITY") {
            self.ipc.inbox_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("WEFT_HANDSHAKE_RETRY_MS") {
            self.channel.handshake_retry_ms = v;
        }
        if let Some(v) = env_parse::<usize>("WEFT_CALL_BUFFER_LIMIT") {
            self.channel.call_buffer_limit = v;
        }
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|v| v.parse::<T>().ok())
}
