use super::settings::{PartialSettings, Settings};
use super::{StoreBackend, load_config_from};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8888);
    assert_eq!(settings.server.ws_port, None);
    assert_eq!(settings.broker.queue_capacity, 10_000);
    assert_eq!(settings.broker.consumer_prefetch, 1);
    assert_eq!(settings.broker.replay_window, 0);
    assert_eq!(settings.persistence.backend, StoreBackend::Sled);
    assert_eq!(settings.persistence.path, ".msg_data");
    assert_eq!(settings.log.level, "info");
}

#[test]
fn test_empty_partial_keeps_defaults() {
    let merged = PartialSettings::default().merge_onto(Settings::default());
    assert_eq!(merged.server.port, 8888);
    assert_eq!(merged.broker.ack_timeout_ms, 30_000);
    assert!(merged.persistence.sync_writes);
}

#[test]
#[serial]
fn test_load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("broker.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000
        ws_port = 9001

        [broker]
        queue_capacity = 10
        replay_window = 5

        [persistence]
        backend = "memory"
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str()).expect("load_config_from failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.ws_port, Some(9001));
    assert_eq!(cfg.broker.queue_capacity, 10);
    assert_eq!(cfg.broker.replay_window, 5);
    assert_eq!(cfg.broker.consumer_prefetch, 1);
    assert_eq!(cfg.persistence.backend, StoreBackend::Memory);
    assert_eq!(cfg.persistence.path, ".msg_data");
}

#[test]
#[serial]
fn test_environment_overrides_defaults() {
    temp_env::with_vars(
        [
            ("MSGBROKER_SERVER__PORT", Some("7777")),
            ("MSGBROKER_BROKER__QUEUE_CAPACITY", Some("42")),
            ("MSGBROKER_PERSISTENCE__SYNC_WRITES", Some("false")),
        ],
        || {
            let cfg = load_config_from(None).expect("load_config_from failed");
            assert_eq!(cfg.server.port, 7777);
            assert_eq!(cfg.broker.queue_capacity, 42);
            assert!(!cfg.persistence.sync_writes);
            assert_eq!(cfg.server.host, "127.0.0.1");
        },
    );
}

#[test]
#[serial]
fn test_missing_explicit_file_is_an_error() {
    assert!(load_config_from(Some("/definitely/not/here/broker.toml")).is_err());
}
