//! Message store interface and the shared in-memory message index.
//!
//! The store owns message bodies and nothing else: lease state lives in
//! [`crate::lease::LeaseManager`]. Every backend keeps a [`MessageIndex`] in
//! memory; durable backends additionally persist each change before the index
//! is updated, so a failed write never leaves partial state behind.

use crate::error::BrokerError;
use crate::message::{Message, MessageId, QueueName, Timestamp};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// Interface implemented by message store backends (memory, file journal)
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a queue; returns `false` if it already existed
    async fn create_queue(&self, queue: &QueueName) -> Result<bool, BrokerError>;

    /// Delete a queue and all of its messages; returns `false` if it did not exist
    async fn delete_queue(&self, queue: &QueueName) -> Result<bool, BrokerError>;

    /// Check whether a queue exists
    fn contains_queue(&self, queue: &QueueName) -> bool;

    /// List queues in name order
    fn list_queues(&self) -> Vec<QueueName>;

    /// Append a new message in the available state
    async fn enqueue(&self, queue: &QueueName, body: Bytes) -> Result<MessageId, BrokerError>;

    /// Look up a message
    fn get(&self, queue: &QueueName, message_id: &MessageId)
        -> Result<Option<Message>, BrokerError>;

    /// Permanently delete a message; returns `false` if it was already gone
    async fn remove(&self, queue: &QueueName, message_id: &MessageId)
        -> Result<bool, BrokerError>;

    /// Number of stored messages, leased or not
    fn count(&self, queue: &QueueName) -> Result<usize, BrokerError>;

    /// Up to `limit` messages in enqueue order, skipping ids rejected by `exclude`
    fn oldest(
        &self,
        queue: &QueueName,
        limit: usize,
        exclude: &dyn Fn(&MessageId) -> bool,
    ) -> Result<Vec<Message>, BrokerError>;

    /// Remove every message enqueued before `cutoff`, returning their ids
    async fn purge_before(
        &self,
        queue: &QueueName,
        cutoff: &Timestamp,
    ) -> Result<Vec<MessageId>, BrokerError>;

    /// Backend name for diagnostics
    fn backend(&self) -> &'static str;
}

// ============================================================================
// Shared Index
// ============================================================================

/// Concurrent index of all queues and their messages
#[derive(Default)]
pub(crate) struct MessageIndex {
    queues: DashMap<QueueName, Arc<QueueIndex>>,
}

impl MessageIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an empty queue; returns `false` if it already existed
    pub(crate) fn create_queue(&self, queue: &QueueName) -> bool {
        match self.queues.entry(queue.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::new(QueueIndex::default()));
                true
            }
        }
    }

    /// Install a queue rebuilt from persisted state
    pub(crate) fn restore_queue(&self, queue: QueueName, messages: Vec<Message>) {
        let index = QueueIndex::default();
        let mut next_sequence = 0;
        for message in messages {
            next_sequence = next_sequence.max(message.sequence + 1);
            index.messages.insert(message.id.clone(), message);
        }
        index.next_sequence.store(next_sequence, Ordering::SeqCst);
        self.queues.insert(queue, Arc::new(index));
    }

    pub(crate) fn drop_queue(&self, queue: &QueueName) -> bool {
        self.queues.remove(queue).is_some()
    }

    pub(crate) fn contains_queue(&self, queue: &QueueName) -> bool {
        self.queues.contains_key(queue)
    }

    pub(crate) fn list_queues(&self) -> Vec<QueueName> {
        let mut names: Vec<QueueName> = self.queues.iter().map(|q| q.key().clone()).collect();
        names.sort();
        names
    }

    /// Resolve a queue, releasing the map shard before returning
    pub(crate) fn queue(&self, queue: &QueueName) -> Result<Arc<QueueIndex>, BrokerError> {
        self.queues
            .get(queue)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| BrokerError::QueueNotFound {
                queue_name: queue.to_string(),
            })
    }
}

/// Messages of one queue, keyed by id
#[derive(Default)]
pub(crate) struct QueueIndex {
    messages: DashMap<MessageId, Message>,
    next_sequence: AtomicU64,
}

impl QueueIndex {
    /// Build a new message with the next sequence number
    pub(crate) fn allocate(&self, body: Bytes) -> Message {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        Message::new(body, sequence)
    }

    pub(crate) fn insert(&self, message: Message) {
        self.messages.insert(message.id.clone(), message);
    }

    pub(crate) fn get(&self, message_id: &MessageId) -> Option<Message> {
        self.messages.get(message_id).map(|m| m.value().clone())
    }

    pub(crate) fn contains(&self, message_id: &MessageId) -> bool {
        self.messages.contains_key(message_id)
    }

    pub(crate) fn remove(&self, message_id: &MessageId) -> Option<Message> {
        self.messages.remove(message_id).map(|(_, m)| m)
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    pub(crate) fn oldest(
        &self,
        limit: usize,
        exclude: &dyn Fn(&MessageId) -> bool,
    ) -> Vec<Message> {
        if limit == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| !exclude(m.key()))
            .map(|m| m.value().clone())
            .collect();
        candidates.sort_unstable_by_key(|m| m.sequence);
        candidates.truncate(limit);
        candidates
    }

    pub(crate) fn enqueued_before(&self, cutoff: &Timestamp) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.value().enqueued_at < *cutoff)
            .map(|m| m.key().clone())
            .collect()
    }

    /// All messages in enqueue order
    pub(crate) fn snapshot(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self.messages.iter().map(|m| m.value().clone()).collect();
        messages.sort_unstable_by_key(|m| m.sequence);
        messages
    }
}
