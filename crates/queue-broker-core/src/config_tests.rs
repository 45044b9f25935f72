//! Tests for broker configuration.

use super::*;
use serial_test::serial;
use std::io::Write;

#[test]
fn test_config_defaults() {
    let config = BrokerConfig::default();
    assert_eq!(config.queue.visibility_timeout_seconds, 30);
    assert_eq!(config.queue.max_messages_per_receive, 10);
    assert_eq!(config.queue.max_message_size, 262_144);
    assert_eq!(config.queue.max_wait_seconds, 20);
    assert_eq!(config.queue.message_retention_seconds, 345_600);
    assert!(config.sweeper.enabled);
    assert_eq!(config.storage, StorageConfig::Memory);
    assert!(config.receipts.secret.is_none());
    assert_eq!(config.logging.level, "info");
    assert!(config.validate().is_ok());
}

#[test]
fn test_duration_helpers() {
    let defaults = QueueDefaults::default();
    assert_eq!(defaults.visibility_timeout(), Duration::seconds(30));
    assert_eq!(defaults.max_visibility_timeout(), Duration::hours(12));
    assert_eq!(defaults.max_wait(), Duration::seconds(20));
    assert_eq!(defaults.message_retention(), Duration::days(4));

    let sweeper = SweeperConfig::default();
    assert_eq!(sweeper.interval(), std::time::Duration::from_secs(1));
}

#[test]
fn test_validate_rejects_inconsistent_values() {
    let mut config = BrokerConfig::default();
    config.queue.visibility_timeout_seconds = 50_000;
    assert!(matches!(
        config.validate(),
        Err(ConfigurationError::Invalid { .. })
    ));

    let mut config = BrokerConfig::default();
    config.queue.max_messages_per_receive = 0;
    assert!(config.validate().is_err());

    let mut config = BrokerConfig::default();
    config.sweeper.interval_millis = 0;
    assert!(config.validate().is_err());

    // A disabled sweeper does not need an interval
    config.sweeper.enabled = false;
    assert!(config.validate().is_ok());

    let mut config = BrokerConfig::default();
    config.receipts.secret = Some("short".to_string());
    assert!(config.validate().is_err());

    let mut config = BrokerConfig::default();
    config.storage = StorageConfig::File {
        data_dir: PathBuf::new(),
        compact_threshold: 10,
        fsync: false,
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigurationError::Missing { .. })
    ));
}

#[test]
fn test_validate_rejects_durations_beyond_limits() {
    let mut config = BrokerConfig::default();
    config.queue.message_retention_seconds = 10_000_000_000_000;
    assert!(matches!(
        config.validate(),
        Err(ConfigurationError::Invalid { .. })
    ));

    let mut config = BrokerConfig::default();
    config.queue.max_visibility_timeout_seconds = u64::MAX;
    assert!(config.validate().is_err());

    let mut config = BrokerConfig::default();
    config.queue.max_wait_seconds = WAIT_LIMIT_SECONDS + 1;
    assert!(config.validate().is_err());

    let mut config = BrokerConfig::default();
    config.queue.message_retention_seconds = RETENTION_LIMIT_SECONDS;
    config.queue.max_wait_seconds = WAIT_LIMIT_SECONDS;
    assert!(config.validate().is_ok());
}

#[test]
fn test_duration_helpers_saturate_instead_of_wrapping() {
    let defaults = QueueDefaults {
        max_visibility_timeout_seconds: u64::MAX,
        message_retention_seconds: 10_000_000_000_000,
        ..QueueDefaults::default()
    };
    assert_eq!(defaults.max_visibility_timeout(), Duration::MAX);
    assert_eq!(defaults.message_retention(), Duration::MAX);
}

#[test]
fn test_receipt_secret_is_redacted_in_debug() {
    let config = ReceiptConfig {
        secret: Some("super-secret-signing-key".to_string()),
    };
    let debug = format!("{:?}", config);
    assert!(debug.contains("<REDACTED>"));
    assert!(!debug.contains("super-secret"));
}

#[test]
fn test_storage_config_deserializes_tagged_backend() {
    let memory: StorageConfig = serde_json::from_str(r#"{"backend":"memory"}"#).unwrap();
    assert_eq!(memory, StorageConfig::Memory);

    let file: StorageConfig =
        serde_json::from_str(r#"{"backend":"file","data_dir":"/var/lib/qb"}"#).unwrap();
    assert_eq!(
        file,
        StorageConfig::File {
            data_dir: PathBuf::from("/var/lib/qb"),
            compact_threshold: 1000,
            fsync: false,
        }
    );
}

#[test]
#[serial]
fn test_load_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        r#"
[queue]
visibility_timeout_seconds = 5
max_messages_per_receive = 4

[storage]
backend = "file"
data_dir = "/tmp/queue-broker"
fsync = true

[logging]
level = "debug"
"#
    )
    .unwrap();

    let config = BrokerConfig::load(Some(&path)).unwrap();
    assert_eq!(config.queue.visibility_timeout_seconds, 5);
    assert_eq!(config.queue.max_messages_per_receive, 4);
    // Unspecified fields keep their defaults
    assert_eq!(config.queue.max_wait_seconds, 20);
    assert_eq!(
        config.storage,
        StorageConfig::File {
            data_dir: PathBuf::from("/tmp/queue-broker"),
            compact_threshold: 1000,
            fsync: true,
        }
    );
    assert_eq!(config.logging.level, "debug");
}

#[test]
#[serial]
fn test_load_applies_environment_overrides() {
    std::env::set_var("QB__QUEUE__VISIBILITY_TIMEOUT_SECONDS", "90");
    std::env::set_var("QB__LOGGING__JSON_FORMAT", "true");

    let result = BrokerConfig::load(None);

    std::env::remove_var("QB__QUEUE__VISIBILITY_TIMEOUT_SECONDS");
    std::env::remove_var("QB__LOGGING__JSON_FORMAT");

    let config = result.unwrap();
    assert_eq!(config.queue.visibility_timeout_seconds, 90);
    assert!(config.logging.json_format);
}

#[test]
#[serial]
fn test_load_rejects_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    assert!(matches!(
        BrokerConfig::load(Some(&path)),
        Err(ConfigurationError::Parsing { .. })
    ));
}

#[test]
#[serial]
fn test_load_validates_result() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.toml");
    std::fs::write(&path, "[queue]\nmax_messages_per_receive = 0\n").unwrap();

    assert!(matches!(
        BrokerConfig::load(Some(&path)),
        Err(ConfigurationError::Invalid { .. })
    ));
}
