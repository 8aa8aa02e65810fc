//! Configuration Module
//!
//! Provides TOML-based configuration for mqttdb with support for:
//! - Logging level
//! - Per-client queue limits and retry timing
//! - MQTT delivery policy flags
//! - Durable session expiration
//! - Snapshot persistence and autosave
//! - Environment variable overrides (MQTTDB__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use persistence::PersistenceConfig;

mod persistence;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Queue limits
    pub limits: LimitsConfig,
    /// MQTT delivery policy
    pub mqtt: MqttConfig,
    /// Durable session handling
    pub session: SessionConfig,
    /// Snapshot persistence
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Queue and resource limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum QoS 1/2 messages in flight per client (0 = unlimited)
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Maximum queued messages per client (0 = unlimited)
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    /// Time before an unacknowledged message is resent (e.g. "20s")
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Largest accepted payload in bytes (0 = unlimited)
    pub message_size_limit: usize,
    /// Maximum live message store entries (0 = unlimited)
    pub max_stored_messages: usize,
}

fn default_max_inflight() -> usize {
    20
}
fn default_max_queued() -> usize {
    100
}
fn default_retry_interval() -> Duration {
    Duration::from_secs(20)
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            max_queued: default_max_queued(),
            retry_interval: default_retry_interval(),
            message_size_limit: 0,
            max_stored_messages: 0,
        }
    }
}

/// MQTT delivery policy
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Deliver a message once per matching subscription instead of once per client
    pub allow_duplicate_messages: bool,
    /// Queue QoS 0 messages for offline durable sessions
    pub queue_qos0_messages: bool,
    /// Deliver at the subscription QoS even when the message was published lower
    pub upgrade_outgoing_qos: bool,
}

/// Durable session configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Remove durable sessions offline for longer than this (0 = never)
    #[serde(with = "humantime_serde")]
    pub persistent_client_expiration: Duration,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `MQTTDB__` prefix with double underscores for nesting:
    ///    - `MQTTDB__LIMITS__MAX_INFLIGHT=10` overrides `limits.max_inflight`
    ///    - `MQTTDB__PERSISTENCE__PATH=/var/lib/mqttdb.db` overrides `persistence.path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("limits.max_inflight", 20)?
            .set_default("limits.max_queued", 100)?
            .set_default("limits.retry_interval", "20s")?
            .set_default("limits.message_size_limit", 0)?
            .set_default("limits.max_stored_messages", 0)?
            .set_default("mqtt.allow_duplicate_messages", false)?
            .set_default("mqtt.queue_qos0_messages", false)?
            .set_default("mqtt.upgrade_outgoing_qos", false)?
            .set_default("session.persistent_client_expiration", "0s")?
            .set_default("persistence.enabled", false)?
            .set_default("persistence.path", "mqttdb.db")?
            .set_default("persistence.autosave_interval", "30m")?
            .set_default("persistence.autosave_on_changes", 0)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("MQTTDB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Validation(format!(
                "log.level must be one of {}, got '{}'",
                LEVELS.join(", "),
                self.log.level
            )));
        }

        // Note: 0 means unbounded for all limits

        if self.limits.retry_interval.is_zero() {
            return Err(ConfigError::Validation(
                "limits.retry_interval must be greater than zero".to_string(),
            ));
        }

        if self.persistence.enabled && self.persistence.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "persistence.path is required when persistence is enabled".to_string(),
            ));
        }

        Ok(())
    }
}
