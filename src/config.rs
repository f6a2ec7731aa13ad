//! Configuration for the orchestrator binary.
//!
//! Supports YAML file and environment variable overrides.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::EngineOptions;
use crate::http_invoker::HttpInvokerConfig;
use crate::tracker::TrackerConfig;
use crate::RetryPolicy;

/// Orchestrator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub tracker: TrackerConfig,
    /// Service name to base URL
    pub services: HashMap<String, String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Lmdb,
}

impl std::str::FromStr for StorageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "lmdb" => Ok(Self::Lmdb),
            other => Err(ConfigError::Invalid(format!("unknown storage kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Directory of the LMDB environment
    pub path: String,
    pub map_size_mb: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Memory,
            path: "./data/sagas".to_string(),
            map_size_mb: 1024,
        }
    }
}

/// Engine-wide retry defaults and outbound call settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub default_retry_interval_ms: u64,
    pub default_max_attempts: u32,
    pub default_backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Timeout of a single outbound HTTP request
    pub request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            default_retry_interval_ms: retry.initial_delay_millis,
            default_max_attempts: retry.max_attempts,
            default_backoff_multiplier: retry.backoff_multiplier,
            max_delay_ms: retry.max_delay_millis,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file (`path`, else `SAGA_CONFIG`, else `config.yaml` if present)
    /// 3. Defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(str::to_string)
            .or_else(|| std::env::var("SAGA_CONFIG").ok());

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new("config.yaml").exists() => Self::from_file("config.yaml")?,
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply overrides from `SAGA_*` variables, read through `var`
    pub fn apply_overrides(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = var("SAGA_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("SAGA_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("SAGA_PORT is not a port: '{port}'")))?;
        }
        if let Some(path) = var("SAGA_STORAGE_PATH") {
            self.storage.path = path;
        }
        if let Some(kind) = var("SAGA_STORAGE_KIND") {
            self.storage.kind = kind.parse()?;
        }
        if let Some(format) = var("SAGA_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(ConfigError::Invalid(format!("unknown log format '{other}'")));
                }
            };
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "engine.default_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.engine.default_backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "engine.default_backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bad listen address: {e}")))
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            retry_defaults: RetryPolicy {
                max_attempts: self.engine.default_max_attempts,
                initial_delay_millis: self.engine.default_retry_interval_ms,
                max_delay_millis: self.engine.max_delay_ms,
                backoff_multiplier: self.engine.default_backoff_multiplier,
            },
            tracker: self.tracker.clone(),
            ..Default::default()
        }
    }

    pub fn invoker_config(&self) -> HttpInvokerConfig {
        HttpInvokerConfig {
            services: self.services.clone(),
            default_base_url: None,
            timeout: Duration::from_millis(self.engine.request_timeout_ms),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.kind, StorageKind::Memory);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.engine.default_max_attempts, 3);
        assert_eq!(config.tracker.bucket_width_secs, 60);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9090

storage:
  kind: lmdb
  path: /tmp/sagas

engine:
  default_max_attempts: 5

tracker:
  bucket_width_secs: 30

services:
  inventory: http://inventory:8000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.storage.kind, StorageKind::Lmdb);
        assert_eq!(config.storage.map_size_mb, 1024);
        assert_eq!(config.listen_addr().unwrap().port(), 9090);
        assert_eq!(config.engine_options().retry_defaults.max_attempts, 5);
        assert_eq!(config.tracker.retained_buckets, 7 * 24 * 60);
        assert_eq!(
            config.invoker_config().services["inventory"],
            "http://inventory:8000"
        );
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(|key| match key {
                "SAGA_PORT" => Some("7000".to_string()),
                "SAGA_STORAGE_KIND" => Some("LMDB".to_string()),
                "SAGA_LOG_FORMAT" => Some("json".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.storage.kind, StorageKind::Lmdb);
        assert_eq!(config.logging.format, LogFormat::Json);

        let err = config
            .apply_overrides(|key| (key == "SAGA_PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
