//! In-memory message store for embedded use and testing.
//!
//! Messages live only in the concurrent index and are lost when the process
//! exits. Operations never fail with a storage error.

use crate::error::BrokerError;
use crate::message::{Message, MessageId, QueueName, Timestamp};
use crate::store::{MessageIndex, MessageStore};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// In-memory message store
#[derive(Default)]
pub struct InMemoryMessageStore {
    index: MessageIndex,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_queue(&self, queue: &QueueName) -> Result<bool, BrokerError> {
        Ok(self.index.create_queue(queue))
    }

    async fn delete_queue(&self, queue: &QueueName) -> Result<bool, BrokerError> {
        Ok(self.index.drop_queue(queue))
    }

    fn contains_queue(&self, queue: &QueueName) -> bool {
        self.index.contains_queue(queue)
    }

    fn list_queues(&self) -> Vec<QueueName> {
        self.index.list_queues()
    }

    async fn enqueue(&self, queue: &QueueName, body: Bytes) -> Result<MessageId, BrokerError> {
        let queue_index = self.index.queue(queue)?;
        let message = queue_index.allocate(body);
        let message_id = message.id.clone();
        queue_index.insert(message);

        debug!(queue = %queue, message_id = %message_id, "Stored message");
        Ok(message_id)
    }

    fn get(
        &self,
        queue: &QueueName,
        message_id: &MessageId,
    ) -> Result<Option<Message>, BrokerError> {
        Ok(self.index.queue(queue)?.get(message_id))
    }

    async fn remove(&self, queue: &QueueName, message_id: &MessageId) -> Result<bool, BrokerError> {
        Ok(self.index.queue(queue)?.remove(message_id).is_some())
    }

    fn count(&self, queue: &QueueName) -> Result<usize, BrokerError> {
        Ok(self.index.queue(queue)?.len())
    }

    fn oldest(
        &self,
        queue: &QueueName,
        limit: usize,
        exclude: &dyn Fn(&MessageId) -> bool,
    ) -> Result<Vec<Message>, BrokerError> {
        Ok(self.index.queue(queue)?.oldest(limit, exclude))
    }

    async fn purge_before(
        &self,
        queue: &QueueName,
        cutoff: &Timestamp,
    ) -> Result<Vec<MessageId>, BrokerError> {
        let queue_index = self.index.queue(queue)?;
        let purged: Vec<MessageId> = queue_index
            .enqueued_before(cutoff)
            .into_iter()
            .filter(|id| queue_index.remove(id).is_some())
            .collect();
        Ok(purged)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
