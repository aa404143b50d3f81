use std::fs;
use std::path::Path;

use weft_core::WeftConfig;

/// High-level configuration for the module host demo
#[derive(Clone, Debug)]
pub struct ModuleHostConfig {
    pub core: WeftConfig,
    /// Number of peer endpoints linked to the coordinator
    pub peers: u32,
    /// Calls made on every opened channel
    pub rounds: u32,
    pub modules: Vec<ModuleSpec>,
}

/// A module type offered to the registry.
#[derive(Clone, Debug)]
pub struct ModuleSpec {
    pub name: String,
    pub request_type: String,
    pub priority: f64,
    pub greeting: String,
}

impl Default for ModuleHostConfig {
    fn default() -> Self {
        Self {
            core: WeftConfig::default().apply_env_overrides(),
            peers: std::env::var("MODULE_HOST_PEERS")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(2),
            rounds: 3,
            modules: vec![
                ModuleSpec {
                    name: "english-greeter".into(),
                    request_type: "greeter".into(),
                    priority: 2.0,
                    greeting: "Hello".into(),
                },
                ModuleSpec {
                    name: "french-greeter".into(),
                    request_type: "greeter".into(),
                    priority: 1.0,
                    greeting: "Bonjour".into(),
                },
            ],
        }
    }
}

impl ModuleHostConfig {
    /// Load configuration from a TOML file (path via MODULE_HOST_CONFIG or ./module_host.toml),
    /// overlaying values onto defaults and env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("MODULE_HOST_CONFIG").unwrap_or_else(|_| "module_host.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "module_host", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<ModuleHostToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "module_host", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "module_host", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ModuleHostToml {
    pub peers: Option<u32>,
    pub rounds: Option<u32>,
    pub core: Option<WeftConfig>,
    pub modules: Option<Vec<ModuleToml>>,
}

impl ModuleHostToml {
    fn overlay(self, mut base: ModuleHostConfig) -> ModuleHostConfig {
        if let Some(x) = self.peers {
            base.peers = x.max(1);
        }
        if let Some(x) = self.rounds {
            base.rounds = x;
        }
        if let Some(x) = self.core {
            base.core = x.apply_env_overrides();
        }
        if let Some(x) = self.modules {
            base.modules = x.into_iter().map(ModuleToml::into_spec).collect();
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ModuleToml {
    pub name: String,
    pub request_type: Option<String>,
    pub priority: Option<f64>,
    pub greeting: Option<String>,
}

impl ModuleToml {
    fn into_spec(self) -> ModuleSpec {
        ModuleSpec {
            request_type: self.request_type.unwrap_or_else(|| "greeter".into()),
            priority: self.priority.unwrap_or(1.0),
            greeting: self.greeting.unwrap_or_else(|| format!("Hi from {}", self.name)),
            name: self.name,
        }
    }
}
