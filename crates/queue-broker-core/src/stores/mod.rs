//! Message store implementations.
//!
//! This module contains concrete implementations of the `MessageStore` trait
//! and a factory that selects one from configuration.

pub mod file;
pub mod memory;

pub use file::FileMessageStore;
pub use memory::InMemoryMessageStore;

use crate::config::StorageConfig;
use crate::error::BrokerError;
use crate::store::MessageStore;
use std::sync::Arc;
use tracing::info;

/// Open the store described by `config`
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn MessageStore>, BrokerError> {
    match config {
        StorageConfig::Memory => {
            info!(backend = "memory", "Opening message store");
            Ok(Arc::new(InMemoryMessageStore::new()))
        }
        StorageConfig::File {
            data_dir,
            compact_threshold,
            fsync,
        } => {
            info!(backend = "file", data_dir = %data_dir.display(), "Opening message store");
            let store = FileMessageStore::open(data_dir.clone(), *compact_threshold, *fsync).await?;
            Ok(Arc::new(store))
        }
    }
}
