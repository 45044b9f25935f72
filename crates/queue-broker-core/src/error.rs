//! Error types for broker operations.

use chrono::Duration;
use thiserror::Error;

/// Comprehensive error type for all broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Storage failure: {message}")]
    Storage { message: String },

    #[error("Message '{message_id}' is already leased")]
    AlreadyLeased { message_id: String },

    #[error("Invalid receipt handle: {reason}")]
    InvalidReceipt { reason: String },

    #[error("Message not found: {message_id}")]
    NotFound { message_id: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl BrokerError {
    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_receipt(reason: impl Into<String>) -> Self {
        Self::InvalidReceipt {
            reason: reason.into(),
        }
    }

    /// Classify the error for structured logging and caller dispatch
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage { .. } => ErrorKind::Storage,
            Self::AlreadyLeased { .. } => ErrorKind::AlreadyLeased,
            Self::InvalidReceipt { .. } => ErrorKind::InvalidReceipt,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::QueueNotFound { .. } => ErrorKind::QueueNotFound,
            Self::MessageTooLarge { .. } => ErrorKind::InvalidRequest,
            Self::Serialization(_) => ErrorKind::InvalidRequest,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Validation(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Check if error is transient and the operation may be retried as-is
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage { .. } => true,
            Self::AlreadyLeased { .. } => true,
            Self::InvalidReceipt { .. } => false,
            Self::NotFound { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::Serialization(_) => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Storage { .. } => Some(Duration::seconds(1)),
            Self::AlreadyLeased { .. } => Some(Duration::zero()),
            _ => None,
        }
    }
}

/// Stable error classification used in log events and CLI output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Storage,
    AlreadyLeased,
    InvalidReceipt,
    NotFound,
    QueueNotFound,
    InvalidRequest,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage_error",
            Self::AlreadyLeased => "already_leased",
            Self::InvalidReceipt => "invalid_receipt",
            Self::NotFound => "not_found",
            Self::QueueNotFound => "queue_not_found",
            Self::InvalidRequest => "invalid_request",
            Self::Configuration => "configuration_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors during message body encoding/decoding
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
