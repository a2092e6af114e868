//! Client configuration loading and validation
//!
//! Tests focus on observable outcomes of loading TOML files and URI options.

use broker_failover::config::{ClientConfig, ConfigError, FailoverConfig};
use broker_failover::transport::CompositeUri;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[failover]
uris = ["mock://a:1", "mock://b:2"]
randomize = false
backup = true
backup_pool_size = 2
max_reconnect_attempts = 5
timeout_ms = 2000

[logging]
level = "DEBUG"
format = "pretty"
"#
    )
    .unwrap();

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.failover.uris, vec!["mock://a:1", "mock://b:2"]);
    assert!(!config.failover.randomize);
    assert!(config.failover.backup);
    assert_eq!(config.failover.backup_pool_size, 2);
    assert_eq!(config.failover.max_reconnect_attempts, Some(5));
    assert_eq!(config.failover.timeout_ms, Some(2000));
    assert_eq!(config.logging.level, "DEBUG");
    assert_eq!(config.logging.format, "pretty");
}

#[test]
fn test_omitted_fields_take_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[failover]
uris = ["mock://a:1"]
"#
    )
    .unwrap();

    let config = ClientConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.failover, FailoverConfig {
        uris: vec!["mock://a:1".to_string()],
        ..FailoverConfig::default()
    });
    assert_eq!(config.logging.level, "INFO");
    assert_eq!(config.logging.format, "json");
}

#[test]
fn test_empty_uri_list_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[failover]\nuris = []").unwrap();

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_malformed_toml_is_reported() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[failover\nuris = ").unwrap();

    let result = ClientConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_file_is_reported() {
    let result = ClientConfig::load_from_file(Path::new("/nonexistent/failover.toml"));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_uri_options_resolve_to_config() {
    let uri = CompositeUri::parse(
        "failover://(mock://a:1,mock://b:2)?randomize=false&maxReconnectAttempts=-1&startupMaxReconnectAttempts=3&backOffMultiplier=1.5&unknownOption=x",
    )
    .unwrap();

    let config = FailoverConfig::from_uri_options(uri.components, &uri.options).unwrap();

    assert!(!config.randomize);
    assert_eq!(config.max_reconnect_attempts, None);
    assert_eq!(config.startup_max_reconnect_attempts, Some(3));
    assert_eq!(config.back_off_multiplier, 1.5);
}

#[test]
fn test_backoff_multiplier_below_one_is_rejected() {
    let uri = CompositeUri::parse("failover:(mock://a:1)?backOffMultiplier=0.5").unwrap();

    let result = FailoverConfig::from_uri_options(uri.components, &uri.options);

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}
