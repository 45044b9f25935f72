//! Common test utilities for queue-broker integration tests
//!
//! This module provides:
//! - Coordinator builders for the memory and file backends
//! - Queue name helpers

use queue_broker_core::{
    BrokerConfig, QueueCoordinator, QueueDefaults, QueueName, ReceiptCodec, StorageConfig,
};
use std::path::Path;
use std::sync::Arc;

/// Receipt key shared by coordinators that must accept each other's handles
#[allow(dead_code)]
pub const TEST_SECRET: &str = "integration-test-receipt-secret";

pub fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).expect("valid queue name")
}

/// Coordinator over an in-memory store with one queue already created
#[allow(dead_code)]
pub async fn memory_coordinator(name: &str) -> Arc<QueueCoordinator> {
    memory_coordinator_with(name, QueueDefaults::default()).await
}

#[allow(dead_code)]
pub async fn memory_coordinator_with(name: &str, defaults: QueueDefaults) -> Arc<QueueCoordinator> {
    let config = BrokerConfig {
        queue: defaults,
        ..BrokerConfig::default()
    };
    let coordinator = QueueCoordinator::open(&config)
        .await
        .expect("open in-memory coordinator");
    coordinator
        .create_queue(&queue(name))
        .await
        .expect("create queue");
    Arc::new(coordinator)
}

/// Configuration for a file-backed broker in `data_dir`
#[allow(dead_code)]
pub fn file_config(data_dir: &Path, compact_threshold: usize) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.storage = StorageConfig::File {
        data_dir: data_dir.to_path_buf(),
        compact_threshold,
        fsync: false,
    };
    config.receipts.secret = Some(TEST_SECRET.to_string());
    config
}

/// Codec keyed with [`TEST_SECRET`]
#[allow(dead_code)]
pub fn test_codec() -> Arc<ReceiptCodec> {
    Arc::new(ReceiptCodec::new(TEST_SECRET.as_bytes()).expect("valid secret"))
}
