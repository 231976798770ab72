//! Host configuration: TOML file plus environment overrides.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::{StateBackend, StateConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    Io { message: String },

    #[error("Configuration parsing error: {message}")]
    Parse { message: String },
}

/// Top-level host configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    pub state: StateConfig,
    pub http: HttpConfig,
    pub scheduler: SchedulerSettings,
    /// Deadline for synchronous sends, in milliseconds. 0 disables the
    /// deadline.
    pub request_timeout_ms: u64,
    /// Agents registered at startup, before boot.
    pub agents: Vec<AgentSeed>,
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Scheduler and boot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Worker pool size for the deferred boot phase.
    pub boot_workers: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { boot_workers: 4 }
    }
}

/// One agent registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSeed {
    pub id: String,
    #[serde(alias = "class", alias = "className")]
    pub class_name: String,
    #[serde(default)]
    pub params: Value,
    /// When set, only these methods may be invoked on the agent.
    #[serde(default)]
    pub allowed_methods: Option<Vec<String>>,
}

impl HostConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            message: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Apply environment overrides on top of the current values.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(port) = env::var("APIARY_HTTP_PORT") {
            self.http.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "APIARY_HTTP_PORT".to_string(),
                reason: "invalid port number".to_string(),
            })?;
        }
        if let Ok(bind) = env::var("APIARY_HTTP_BIND") {
            self.http.bind_address = bind;
        }
        if let Ok(backend) = env::var("APIARY_STATE_BACKEND") {
            self.state.backend = match backend.as_str() {
                "memory" => StateBackend::Memory,
                "file" => StateBackend::File,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "APIARY_STATE_BACKEND".to_string(),
                        reason: format!("unknown backend: {other}"),
                    });
                }
            };
        }
        if let Ok(path) = env::var("APIARY_STATE_PATH") {
            self.state.path = PathBuf::from(path);
        }
        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "http.port".to_string(),
                reason: "port cannot be 0".to_string(),
            });
        }
        if self.scheduler.boot_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.boot_workers".to_string(),
                reason: "at least one boot worker is required".to_string(),
            });
        }
        for seed in &self.agents {
            if seed.id.is_empty() || seed.class_name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "agents".to_string(),
                    reason: "agent seeds need both an id and a class".to_string(),
                });
            }
        }
        Ok(())
    }

    /// The synchronous-send deadline, if any.
    pub fn request_timeout(&self) -> Option<std::time::Duration> {
        match self.request_timeout_ms {
            0 => None,
            ms => Some(std::time::Duration::from_millis(ms)),
        }
    }
}
