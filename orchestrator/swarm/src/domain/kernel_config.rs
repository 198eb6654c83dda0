// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Kernel Configuration
//!
//! YAML configuration for the kernel, loaded once at process start.
//!
//! ```yaml
//! subscriptions:
//!   queue_capacity: 256
//!   grace_window: 5s
//! operations:
//!   default_timeout: 2s
//!   max_cas_retries: 8
//! audit:
//!   capacity: 1024
//! resources:
//!   soft_warning_ratio: 0.1
//! store:
//!   backend: postgres
//!   connection_string: postgres://aegis@localhost/aegis
//!   max_connections: 10
//! logging:
//!   level: info
//!   format: json
//! ```
//!
//! Every section and field is optional and falls back to the defaults above
//! (the store defaults to `in_memory`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::repository::{PostgresConfig, StoreBackend};

pub const CONFIG_PATH_ENV: &str = "AEGIS_SWARM_CONFIG_PATH";
pub const STORE_URL_ENV: &str = "AEGIS_SWARM_STORE_URL";
pub const LOG_LEVEL_ENV: &str = "AEGIS_SWARM_LOG_LEVEL";
pub const DEFAULT_TIMEOUT_ENV: &str = "AEGIS_SWARM_DEFAULT_TIMEOUT_MS";
const DEFAULT_CONFIG_FILE: &str = "./aegis-swarm.yaml";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("resources.soft_warning_ratio must be within 0.0..=1.0, got {0}")]
    RatioOutOfRange(f64),

    #[error("store.connection_string is required for the postgres backend")]
    MissingConnectionString,

    #[error("unknown logging.format '{0}' (expected 'json' or 'text')")]
    UnknownLogFormat(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub subscriptions: SubscriptionConfig,
    pub operations: OperationConfig,
    pub audit: AuditConfig,
    pub resources: ResourceConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Per-subscriber queue length before the grace window starts.
    pub queue_capacity: usize,
    /// How long a queue may stay full before its subscriber is evicted.
    #[serde(with = "humantime_serde")]
    pub grace_window: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            grace_window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Timeout used by `CallContext::new` when the caller does not pick one.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Internal retries of read-modify-propose loops on `Conflict`.
    pub max_cas_retries: u32,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(2),
            max_cas_retries: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Broadcast buffer of the audit stream.
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Soft pools below this fraction of their allocation produce a warning.
    pub soft_warning_ratio: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self { soft_warning_ratio: 0.1 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreKind::InMemory,
            connection_string: None,
            max_connections: 10,
        }
    }
}

impl StoreConfig {
    /// Resolve into the backend the store factory should build.
    pub fn backend(&self) -> Result<StoreBackend, ConfigError> {
        match self.backend {
            StoreKind::InMemory => Ok(StoreBackend::InMemory),
            StoreKind::Postgres => {
                let connection_string = self
                    .connection_string
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or(ConfigError::MissingConnectionString)?;
                Ok(StoreBackend::PostgreSQL(PostgresConfig {
                    connection_string,
                    max_connections: self.max_connections,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// `json` or `text`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl KernelConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        // An empty document means "all defaults"
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_SWARM_CONFIG_PATH environment variable
    /// 2. ./aegis-swarm.yaml (working directory)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("{} points at {:?}, which does not exist", CONFIG_PATH_ENV, path);
        }

        let cwd = PathBuf::from(DEFAULT_CONFIG_FILE);
        if cwd.exists() {
            return Some(cwd);
        }

        None
    }

    /// Load configuration with discovery, fallback to default. An explicit
    /// path that cannot be read is an error. The result is validated.
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = explicit_path {
            tracing::info!("Loading swarm kernel configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading swarm kernel configuration from discovered path: {:?}", path);
            Self::from_yaml_file(path)?
        } else {
            tracing::debug!("No swarm kernel configuration file found; using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(STORE_URL_ENV) {
            if !url.trim().is_empty() {
                tracing::info!("Environment override: {} (store backend set to postgres)", STORE_URL_ENV);
                self.store.backend = StoreKind::Postgres;
                self.store.connection_string = Some(url);
            }
        }

        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            tracing::info!("Environment override: {}={}", LOG_LEVEL_ENV, level);
            self.logging.level = level;
        }

        if let Ok(val) = std::env::var(DEFAULT_TIMEOUT_ENV) {
            match val.parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Environment override: {}={}", DEFAULT_TIMEOUT_ENV, ms);
                    self.operations.default_timeout = Duration::from_millis(ms);
                }
                Err(_) => tracing::warn!(
                    "Invalid value for {}: '{}'. Expected milliseconds. Ignoring.",
                    DEFAULT_TIMEOUT_ENV,
                    val
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subscriptions.queue_capacity == 0 {
            return Err(ConfigError::Zero("subscriptions.queue_capacity"));
        }
        if self.subscriptions.grace_window.is_zero() {
            return Err(ConfigError::Zero("subscriptions.grace_window"));
        }
        if self.operations.default_timeout.is_zero() {
            return Err(ConfigError::Zero("operations.default_timeout"));
        }
        if self.audit.capacity == 0 {
            return Err(ConfigError::Zero("audit.capacity"));
        }
        let ratio = self.resources.soft_warning_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::RatioOutOfRange(ratio));
        }
        if self.store.backend == StoreKind::Postgres && self.store.max_connections == 0 {
            return Err(ConfigError::Zero("store.max_connections"));
        }
        self.store.backend()?;
        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::UnknownLogFormat(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = KernelConfig::default();
        assert_eq!(config.subscriptions.queue_capacity, 256);
        assert_eq!(config.subscriptions.grace_window, Duration::from_secs(5));
        assert_eq!(config.operations.default_timeout, Duration::from_secs(2));
        assert_eq!(config.store.backend().unwrap(), StoreBackend::InMemory);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = KernelConfig::from_yaml_str(
            r#"
subscriptions:
  grace_window: 250ms
operations:
  max_cas_retries: 3
logging:
  format: json
"#,
        )
        .unwrap();
        assert_eq!(config.subscriptions.grace_window, Duration::from_millis(250));
        assert_eq!(config.subscriptions.queue_capacity, 256);
        assert_eq!(config.operations.max_cas_retries, 3);
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(KernelConfig::from_yaml_str("").unwrap(), KernelConfig::default());
    }

    #[test]
    fn test_postgres_requires_connection_string() {
        let mut config = KernelConfig::default();
        config.store.backend = StoreKind::Postgres;
        assert_eq!(config.validate(), Err(ConfigError::MissingConnectionString));

        config.store.connection_string = Some("postgres://localhost/aegis".into());
        config.validate().unwrap();
        assert!(matches!(config.store.backend().unwrap(), StoreBackend::PostgreSQL(_)));
    }

    #[test]
    fn test_rejects_nonsense_values() {
        let mut config = KernelConfig::default();
        config.resources.soft_warning_ratio = 1.5;
        assert_eq!(config.validate(), Err(ConfigError::RatioOutOfRange(1.5)));

        let mut config = KernelConfig::default();
        config.subscriptions.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = KernelConfig::default();
        config.logging.format = "xml".into();
        assert!(matches!(config.validate(), Err(ConfigError::UnknownLogFormat(_))));
    }

    #[test]
    fn test_yaml_roundtrip_keeps_durations_readable() {
        let yaml = KernelConfig::default().to_yaml_string().unwrap();
        assert!(yaml.contains("grace_window: 5s"));
        assert_eq!(KernelConfig::from_yaml_str(&yaml).unwrap(), KernelConfig::default());
    }
}
