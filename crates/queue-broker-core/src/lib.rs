//! # Queue Broker Core
//!
//! Embeddable message-queue broker with SQS-like semantics: messages are
//! enqueued, leased to one consumer at a time for a visibility timeout, and
//! deleted with the receipt handle issued for that lease.
//!
//! This library provides:
//! - Pluggable message stores (in-memory, file journal)
//! - Per-queue lease tracking with constant-time receipt validation
//! - HMAC-signed receipt handles
//! - Long-polling receive with cooperative shutdown
//! - Background sweeping of expired leases and retention
//! - A record-oriented table facade for ORM-style callers
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all broker operations
//! - [`message`] - Identifiers, messages and receive options
//! - [`config`] - Layered configuration
//! - [`store`] / [`stores`] - Message store interface and backends
//! - [`lease`] - Lease manager
//! - [`receipt`] - Receipt handle codec
//! - [`coordinator`] - Queue operations and the [`QueueBroker`] capability
//! - [`sweeper`] - Background maintenance task
//! - [`table`] - Record table facade
//!
//! ## Example
//!
//! ```rust,no_run
//! use queue_broker_core::{BrokerConfig, QueueCoordinator, QueueName, ReceiveOptions};
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let coordinator = QueueCoordinator::open(&BrokerConfig::default()).await?;
//! let orders = QueueName::new("orders".to_string())?;
//! coordinator.create_queue(&orders).await?;
//!
//! coordinator.send(&orders, Bytes::from_static(b"{\"x\":1}")).await?;
//! for message in coordinator.receive(&orders, ReceiveOptions::new()).await? {
//!     coordinator.delete(&orders, &message.receipt_handle).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lease;
pub mod message;
pub mod receipt;
pub mod store;
pub mod stores;
pub mod sweeper;
pub mod table;

// Re-export commonly used types at crate root for convenience
pub use config::{
    BrokerConfig, LoggingConfig, QueueDefaults, ReceiptConfig, StorageConfig, SweeperConfig,
};
pub use coordinator::{QueueBroker, QueueCoordinator, SweepReport};
pub use error::{BrokerError, ConfigurationError, ErrorKind, SerializationError, ValidationError};
pub use lease::{Lease, LeaseManager, Settlement};
pub use message::{
    Message, MessageId, QueueName, QueueStats, ReceiptHandle, ReceiveOptions, ReceivedMessage,
    Timestamp,
};
pub use receipt::{ReceiptClaims, ReceiptCodec};
pub use store::MessageStore;
pub use stores::{open_store, FileMessageStore, InMemoryMessageStore};
pub use sweeper::spawn_sweeper;
pub use table::{QueueTable, ReceivedRecord, Record};
