//! Configuration for failover transports
//!
//! A [`FailoverConfig`] is built either from the query options of a
//! `failover://(...)?...` URI or from the `[failover]` table of a TOML client
//! configuration file. Both routes end in [`FailoverConfig::validate`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Client configuration file layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub failover: FailoverConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Logging section of the client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    /// Log level (ERROR, WARN, INFO, DEBUG, TRACE)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Emit span open/close events
    #[serde(default)]
    pub spans: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            spans: false,
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Failover transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverConfig {
    /// Candidate broker URIs, in configured order
    #[serde(default)]
    pub uris: Vec<String>,
    /// Pick candidates at random instead of in order
    #[serde(default = "default_true")]
    pub randomize: bool,
    /// Keep pre-connected standby transports
    #[serde(default)]
    pub backup: bool,
    #[serde(default = "default_backup_pool_size")]
    pub backup_pool_size: usize,
    /// Prefer priority brokers and move back to them when they return
    #[serde(default)]
    pub priority_backup: bool,
    /// Explicit priority brokers; when empty the first URI is the priority one
    #[serde(default)]
    pub priority_uris: Vec<String>,
    /// How long a send may wait for a connection (None = forever)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Bound on a single connect or restore step
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_initial_reconnect_delay")]
    pub initial_reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_ms: u64,
    #[serde(default = "default_back_off_multiplier")]
    pub back_off_multiplier: f64,
    #[serde(default = "default_true")]
    pub use_exponential_back_off: bool,
    /// Retries after the first attempt (None = unlimited)
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    /// Retry limit before the first successful connect (None = use max_reconnect_attempts)
    #[serde(default)]
    pub startup_max_reconnect_attempts: Option<u32>,
    /// Cache non-transacted messages for replay after reconnect
    #[serde(default)]
    pub track_messages: bool,
    #[serde(default = "default_true")]
    pub track_transaction_producers: bool,
    /// Message cache bound in bytes
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,
    #[serde(default = "default_max_pull_cache_size")]
    pub max_pull_cache_size: usize,
    /// Honour broker requests to reconnect elsewhere
    #[serde(default = "default_true")]
    pub reconnect_supported: bool,
    /// Honour broker-pushed broker lists
    #[serde(default = "default_true")]
    pub update_uris_supported: bool,
    /// Rebalance when a broker-pushed list asks for it
    #[serde(default = "default_true")]
    pub rebalance_update_uris: bool,
}

fn default_true() -> bool {
    true
}

fn default_backup_pool_size() -> usize {
    1
}

fn default_connect_timeout() -> u64 {
    30_000
}

fn default_initial_reconnect_delay() -> u64 {
    10
}

fn default_max_reconnect_delay() -> u64 {
    30_000
}

fn default_back_off_multiplier() -> f64 {
    2.0
}

fn default_max_cache_size() -> usize {
    128 * 1024
}

fn default_max_pull_cache_size() -> usize {
    10
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            uris: Vec::new(),
            randomize: true,
            backup: false,
            backup_pool_size: default_backup_pool_size(),
            priority_backup: false,
            priority_uris: Vec::new(),
            timeout_ms: None,
            connect_timeout_ms: default_connect_timeout(),
            initial_reconnect_delay_ms: default_initial_reconnect_delay(),
            max_reconnect_delay_ms: default_max_reconnect_delay(),
            back_off_multiplier: default_back_off_multiplier(),
            use_exponential_back_off: true,
            max_reconnect_attempts: None,
            startup_max_reconnect_attempts: None,
            track_messages: false,
            track_transaction_producers: true,
            max_cache_size: default_max_cache_size(),
            max_pull_cache_size: default_max_pull_cache_size(),
            reconnect_supported: true,
            update_uris_supported: true,
            rebalance_update_uris: true,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid value '{value}' for option '{key}': {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },
    #[error("Invalid URI: {0}")]
    InvalidUri(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FailoverConfig {
    /// Build a configuration from component URIs and URI query options
    pub fn from_uri_options(
        uris: Vec<String>,
        options: &BTreeMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self {
            uris,
            ..Self::default()
        };
        for (key, value) in options {
            config.apply_option(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply a single URI option by its camelCase name
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "randomize" => self.randomize = parse_bool(key, value)?,
            "backup" => self.backup = parse_bool(key, value)?,
            "backupPoolSize" => self.backup_pool_size = parse_number(key, value)?,
            "priorityBackup" => self.priority_backup = parse_bool(key, value)?,
            "priorityURIs" => {
                self.priority_uris = value
                    .split(',')
                    .map(str::trim)
                    .filter(|uri| !uri.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "timeout" => {
                let timeout: i64 = parse_number(key, value)?;
                self.timeout_ms = u64::try_from(timeout).ok();
            }
            "connectTimeout" => self.connect_timeout_ms = parse_number(key, value)?,
            "initialReconnectDelay" => self.initial_reconnect_delay_ms = parse_number(key, value)?,
            "maxReconnectDelay" => self.max_reconnect_delay_ms = parse_number(key, value)?,
            "backOffMultiplier" => self.back_off_multiplier = parse_number(key, value)?,
            "useExponentialBackOff" => self.use_exponential_back_off = parse_bool(key, value)?,
            "maxReconnectAttempts" => {
                self.max_reconnect_attempts = parse_attempt_limit(key, value)?;
            }
            "startupMaxReconnectAttempts" => {
                self.startup_max_reconnect_attempts = parse_attempt_limit(key, value)?;
            }
            "trackMessages" => self.track_messages = parse_bool(key, value)?,
            "trackTransactionProducers" => {
                self.track_transaction_producers = parse_bool(key, value)?;
            }
            "maxCacheSize" => self.max_cache_size = parse_number(key, value)?,
            "maxPullCacheSize" => self.max_pull_cache_size = parse_number(key, value)?,
            "reconnectSupported" => self.reconnect_supported = parse_bool(key, value)?,
            "updateURIsSupported" => self.update_uris_supported = parse_bool(key, value)?,
            "rebalanceUpdateURIs" => self.rebalance_update_uris = parse_bool(key, value)?,
            _ => debug!("Ignoring unknown failover option {}={}", key, value),
        }
        Ok(())
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uris.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one broker URI is required".to_string(),
            ));
        }

        if self.back_off_multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(format!(
                "backOffMultiplier must be >= 1, got {}",
                self.back_off_multiplier
            )));
        }

        if self.backups_enabled() && self.backup_pool_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "backupPoolSize must be greater than 0 when backups are enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Backups run when either plain or priority backups are requested
    pub fn backups_enabled(&self) -> bool {
        self.backup || self.priority_backup
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.failover.validate()?;
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid_option(key, value, "expected true or false")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| invalid_option(key, value, &e.to_string()))
}

/// Negative attempt limits mean unlimited
fn parse_attempt_limit(key: &str, value: &str) -> Result<Option<u32>, ConfigError> {
    let limit: i64 = parse_number(key, value)?;
    if limit < 0 {
        return Ok(None);
    }
    u32::try_from(limit)
        .map(Some)
        .map_err(|e| invalid_option(key, value, &e.to_string()))
}

fn invalid_option(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let config = FailoverConfig::default();

        assert!(config.randomize);
        assert!(!config.backup);
        assert_eq!(config.backup_pool_size, 1);
        assert_eq!(config.timeout_ms, None);
        assert_eq!(config.initial_reconnect_delay_ms, 10);
        assert_eq!(config.max_reconnect_delay_ms, 30_000);
        assert_eq!(config.back_off_multiplier, 2.0);
        assert!(config.use_exponential_back_off);
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.startup_max_reconnect_attempts, None);
        assert!(!config.track_messages);
        assert!(config.track_transaction_producers);
        assert_eq!(config.max_cache_size, 131_072);
        assert_eq!(config.max_pull_cache_size, 10);
        assert!(config.reconnect_supported);
        assert!(config.update_uris_supported);
        assert!(config.rebalance_update_uris);
    }

    #[test]
    fn test_uri_options_applied() {
        let config = FailoverConfig::from_uri_options(
            vec!["mock://a:1".to_string(), "mock://b:2".to_string()],
            &options(&[
                ("randomize", "false"),
                ("maxReconnectAttempts", "3"),
                ("initialReconnectDelay", "100"),
                ("timeout", "2500"),
                ("priorityBackup", "true"),
                ("priorityURIs", "mock://b:2, mock://c:3"),
                ("backOffMultiplier", "1.5"),
            ]),
        )
        .unwrap();

        assert!(!config.randomize);
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert_eq!(config.initial_reconnect_delay_ms, 100);
        assert_eq!(config.timeout(), Some(Duration::from_millis(2500)));
        assert!(config.backups_enabled());
        assert_eq!(config.priority_uris, vec!["mock://b:2", "mock://c:3"]);
        assert_eq!(config.back_off_multiplier, 1.5);
    }

    #[test]
    fn test_negative_values_mean_unlimited() {
        let config = FailoverConfig::from_uri_options(
            vec!["mock://a:1".to_string()],
            &options(&[
                ("maxReconnectAttempts", "-1"),
                ("startupMaxReconnectAttempts", "-1"),
                ("timeout", "-1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.startup_max_reconnect_attempts, None);
        assert_eq!(config.timeout_ms, None);
    }

    #[test]
    fn test_malformed_option_rejected() {
        let result = FailoverConfig::from_uri_options(
            vec!["mock://a:1".to_string()],
            &options(&[("randomize", "sometimes")]),
        );

        match result {
            Err(ConfigError::InvalidOption { key, .. }) => assert_eq!(key, "randomize"),
            other => panic!("Expected InvalidOption, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_option_ignored() {
        let config = FailoverConfig::from_uri_options(
            vec!["mock://a:1".to_string()],
            &options(&[("someFutureOption", "1")]),
        );
        assert!(config.is_ok());
    }

    #[test]
    fn test_validation_rules() {
        let empty = FailoverConfig::default();
        assert!(empty.validate().is_err());

        let bad_multiplier = FailoverConfig {
            uris: vec!["mock://a:1".to_string()],
            back_off_multiplier: 0.5,
            ..FailoverConfig::default()
        };
        assert!(bad_multiplier.validate().is_err());

        let empty_pool = FailoverConfig {
            uris: vec!["mock://a:1".to_string()],
            backup: true,
            backup_pool_size: 0,
            ..FailoverConfig::default()
        };
        assert!(empty_pool.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[failover]
uris = ["mock://primary:61616", "mock://secondary:61616"]
randomize = false
backup = true
max_reconnect_attempts = 5

[logging]
level = "DEBUG"
format = "pretty"
"#
        )
        .unwrap();

        let config = ClientConfig::load_from_file(file.path()).unwrap();

        assert_eq!(config.failover.uris.len(), 2);
        assert!(!config.failover.randomize);
        assert!(config.failover.backup);
        assert_eq!(config.failover.max_reconnect_attempts, Some(5));
        assert_eq!(config.failover.initial_reconnect_delay_ms, 10);
        assert_eq!(config.logging.level, "DEBUG");
        assert!(!config.logging.spans);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let result = ClientConfig::from_toml_str("[failover]\nuris = []\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

        let result = ClientConfig::from_toml_str("not toml at all [");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }
}
