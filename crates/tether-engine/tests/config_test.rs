use std::io::Write;

use tempfile::NamedTempFile;
use tether_engine::config::{ConfigError, ConfigLoader};

#[tokio::test]
async fn test_partial_file_keeps_defaults_for_the_rest() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "relay:\n  command_timeout_ms: 2500\nmutations:\n  debounce_ms: 40\nserver:\n  http_port: 7000"
    )
    .unwrap();

    let config = ConfigLoader::load_from(file.path()).await.unwrap();
    assert_eq!(config.relay.command_timeout_ms, 2500);
    assert_eq!(config.relay.buffer_capacity, 1000);
    assert_eq!(config.mutations.debounce_ms, 40);
    assert_eq!(config.mutations.notable_limit, 10);
    assert_eq!(config.server.http_port, 7000);
    assert_eq!(config.server.observer_port, 9001);
    assert_eq!(config.events.text_idle_ms, 800);
}

#[tokio::test]
async fn test_empty_file_is_default_config() {
    let file = NamedTempFile::new().unwrap();
    let config = ConfigLoader::load_from(file.path()).await.unwrap();
    assert_eq!(config.server.bind, "127.0.0.1");
    assert_eq!(config.relay.command_timeout().as_millis(), 10_000);
}

#[tokio::test]
async fn test_malformed_yaml_is_a_parse_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "relay: [not, a, map").unwrap();
    let err = ConfigLoader::load_from(file.path()).await.unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[tokio::test]
async fn test_missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ConfigLoader::load_from(&dir.path().join("absent.yaml"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
