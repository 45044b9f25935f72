//! Broker configuration.
//!
//! Configuration is an explicit value threaded through constructors. Loading
//! layers an optional file (TOML, YAML or JSON, chosen by extension) under
//! environment variables prefixed `QB` with `__` as the nesting separator,
//! e.g. `QB__QUEUE__VISIBILITY_TIMEOUT_SECONDS=60`.

use crate::error::ConfigurationError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "QB";

/// Longest lease SQS allows (12 hours)
pub const VISIBILITY_TIMEOUT_LIMIT_SECONDS: u64 = 43_200;

/// Longest long-poll wait SQS allows
pub const WAIT_LIMIT_SECONDS: u64 = 20;

/// Longest retention period SQS allows (14 days)
pub const RETENTION_LIMIT_SECONDS: u64 = 1_209_600;

/// Top-level broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Queue-level limits and defaults
    pub queue: QueueDefaults,

    /// Background lease sweeping
    pub sweeper: SweeperConfig,

    /// Message store backend
    pub storage: StorageConfig,

    /// Receipt handle signing
    pub receipts: ReceiptConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl BrokerConfig {
    /// Load configuration from an optional file plus `QB__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.queue.validate()?;

        if self.sweeper.enabled && self.sweeper.interval_millis == 0 {
            return Err(ConfigurationError::Invalid {
                message: "sweeper.interval_millis must be greater than zero".to_string(),
            });
        }

        if let StorageConfig::File {
            data_dir,
            compact_threshold,
            ..
        } = &self.storage
        {
            if data_dir.as_os_str().is_empty() {
                return Err(ConfigurationError::Missing {
                    key: "storage.data_dir".to_string(),
                });
            }
            if *compact_threshold == 0 {
                return Err(ConfigurationError::Invalid {
                    message: "storage.compact_threshold must be greater than zero".to_string(),
                });
            }
        }

        if let Some(secret) = &self.receipts.secret {
            if secret.len() < 16 {
                return Err(ConfigurationError::Invalid {
                    message: "receipts.secret must be at least 16 bytes".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Queue-level limits and defaults, mirroring SQS
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefaults {
    /// Lease duration applied when a receive does not specify one
    pub visibility_timeout_seconds: u64,

    /// Upper bound for any requested lease duration
    pub max_visibility_timeout_seconds: u64,

    /// Upper bound for `max_messages` on a single receive
    pub max_messages_per_receive: u32,

    /// Maximum body size in bytes
    pub max_message_size: usize,

    /// Upper bound for long-poll waits
    pub max_wait_seconds: u64,

    /// Messages older than this are purged by the sweeper
    pub message_retention_seconds: u64,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: 30,
            max_visibility_timeout_seconds: VISIBILITY_TIMEOUT_LIMIT_SECONDS,
            max_messages_per_receive: 10,
            max_message_size: 256 * 1024,         // 256KB
            max_wait_seconds: 20,
            message_retention_seconds: 345_600, // 4 days
        }
    }
}

impl QueueDefaults {
    pub fn visibility_timeout(&self) -> Duration {
        seconds(self.visibility_timeout_seconds)
    }

    pub fn max_visibility_timeout(&self) -> Duration {
        seconds(self.max_visibility_timeout_seconds)
    }

    pub fn max_wait(&self) -> Duration {
        seconds(self.max_wait_seconds)
    }

    pub fn message_retention(&self) -> Duration {
        seconds(self.message_retention_seconds)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_messages_per_receive == 0 {
            return Err(ConfigurationError::Invalid {
                message: "queue.max_messages_per_receive must be greater than zero".to_string(),
            });
        }

        check_limit(
            "queue.max_visibility_timeout_seconds",
            self.max_visibility_timeout_seconds,
            VISIBILITY_TIMEOUT_LIMIT_SECONDS,
        )?;
        check_limit(
            "queue.max_wait_seconds",
            self.max_wait_seconds,
            WAIT_LIMIT_SECONDS,
        )?;
        check_limit(
            "queue.message_retention_seconds",
            self.message_retention_seconds,
            RETENTION_LIMIT_SECONDS,
        )?;

        if self.visibility_timeout_seconds > self.max_visibility_timeout_seconds {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "queue.visibility_timeout_seconds ({}) exceeds queue.max_visibility_timeout_seconds ({})",
                    self.visibility_timeout_seconds, self.max_visibility_timeout_seconds
                ),
            });
        }

        if self.max_message_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "queue.max_message_size must be greater than zero".to_string(),
            });
        }

        if self.message_retention_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "queue.message_retention_seconds must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

fn check_limit(key: &str, value: u64, limit: u64) -> Result<(), ConfigurationError> {
    if value > limit {
        return Err(ConfigurationError::Invalid {
            message: format!("{} ({}) exceeds the limit of {}", key, value, limit),
        });
    }
    Ok(())
}

/// Whole seconds as a duration, saturating at the largest representable value
fn seconds(value: u64) -> Duration {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Background sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    /// Run the sweeper task alongside the broker
    pub enabled: bool,

    /// Delay between sweeps in milliseconds
    pub interval_millis: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_millis: 1000,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_millis)
    }
}

/// Message store backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Volatile in-process store
    Memory,

    /// Append-only journal per queue under `data_dir`
    File {
        data_dir: PathBuf,

        /// Rewrite a journal once it holds this many removal records
        #[serde(default = "default_compact_threshold")]
        compact_threshold: usize,

        /// Flush every journal write to stable storage
        #[serde(default)]
        fsync: bool,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

fn default_compact_threshold() -> usize {
    1000
}

/// Receipt handle signing configuration
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptConfig {
    /// HMAC key for receipt handles; a random key is generated when absent
    pub secret: Option<String>,
}

// Security: Don't expose secrets in debug output
impl std::fmt::Debug for ReceiptConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level or env-filter directive
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
