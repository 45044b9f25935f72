//! Record-oriented facade over a single queue.
//!
//! ORM-style callers treat a queue as a table of flat JSON records: inserting
//! sends a message, finding receives (and leases) messages, and removing
//! deletes a received message by its receipt handle.

use crate::coordinator::QueueBroker;
use crate::error::{BrokerError, SerializationError};
use crate::message::{MessageId, QueueName, ReceiptHandle, ReceiveOptions, ReceivedMessage};
use bytes::Bytes;
use chrono::Duration;
use serde_json::Value;
use std::sync::Arc;

#[cfg(test)]
#[path = "table_tests.rs"]
mod tests;

/// A flat key-value record
pub type Record = serde_json::Map<String, Value>;

/// Field holding the body of messages that are not JSON objects
pub const BODY_FIELD: &str = "body";

/// Field carrying the message id in a flattened row
pub const MESSAGE_ID_FIELD: &str = "message_id";

/// Field carrying the receipt handle in a flattened row
pub const RECEIPT_HANDLE_FIELD: &str = "receipt_handle";

/// A record read from the queue together with the lease that covers it
#[derive(Debug, Clone)]
pub struct ReceivedRecord {
    pub fields: Record,
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub delivery_count: u32,
}

impl ReceivedRecord {
    fn from_message(message: ReceivedMessage) -> Self {
        Self {
            fields: decode_record(&message.body),
            message_id: message.message_id,
            receipt_handle: message.receipt_handle,
            delivery_count: message.delivery_count,
        }
    }

    /// Flatten into one row holding the fields, the message id and the
    /// receipt handle
    pub fn into_row(self) -> Record {
        let mut row = self.fields;
        row.insert(
            MESSAGE_ID_FIELD.to_string(),
            Value::String(self.message_id.to_string()),
        );
        row.insert(
            RECEIPT_HANDLE_FIELD.to_string(),
            Value::String(self.receipt_handle.to_string()),
        );
        row
    }
}

fn decode_record(body: &Bytes) -> Record {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => Record::from_iter([(BODY_FIELD.to_string(), other)]),
        Err(_) => Record::from_iter([(
            BODY_FIELD.to_string(),
            Value::String(String::from_utf8_lossy(body).into_owned()),
        )]),
    }
}

/// A queue seen as a table of records
#[derive(Clone)]
pub struct QueueTable {
    broker: Arc<dyn QueueBroker>,
    queue: QueueName,
}

impl QueueTable {
    pub fn new(broker: Arc<dyn QueueBroker>, queue: QueueName) -> Self {
        Self { broker, queue }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Send `record` as a JSON object message
    pub async fn insert(&self, record: &Record) -> Result<MessageId, BrokerError> {
        let body = serde_json::to_vec(record).map_err(SerializationError::from)?;
        self.broker.send(&self.queue, Bytes::from(body)).await
    }

    /// Receive up to `limit` records, leasing each for `visibility_timeout`
    ///
    /// Always returns a sequence; an empty queue yields an empty one.
    pub async fn find(
        &self,
        limit: u32,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<ReceivedRecord>, BrokerError> {
        let mut options = ReceiveOptions::new().with_max_messages(limit);
        options.visibility_timeout = visibility_timeout;

        let messages = self.broker.receive(&self.queue, options).await?;
        Ok(messages
            .into_iter()
            .map(ReceivedRecord::from_message)
            .collect())
    }

    /// Approximate number of records a find could return
    pub async fn count(&self) -> Result<u64, BrokerError> {
        self.broker.count_available(&self.queue).await
    }

    /// Delete a previously found record
    pub async fn remove(&self, receipt: &ReceiptHandle) -> Result<(), BrokerError> {
        self.broker.delete(&self.queue, receipt).await
    }
}

impl std::fmt::Debug for QueueTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTable")
            .field("queue", &self.queue)
            .finish()
    }
}
