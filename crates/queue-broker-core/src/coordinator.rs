//! Queue coordinator: the broker's public operations.
//!
//! The coordinator enforces queue-level invariants on top of the message
//! store, the per-queue lease managers, and the receipt codec. Store state is
//! always consulted before lease state; the lease managers never call back
//! into the store.

use crate::config::{BrokerConfig, QueueDefaults};
use crate::error::{BrokerError, ValidationError};
use crate::lease::LeaseManager;
use crate::message::{
    MessageId, QueueName, QueueStats, ReceiptHandle, ReceiveOptions, ReceivedMessage, Timestamp,
};
use crate::receipt::ReceiptCodec;
use crate::store::MessageStore;
use crate::stores::open_store;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;

/// Narrow capability interface used by record-style callers
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Enqueue a message body
    async fn send(&self, queue: &QueueName, body: Bytes) -> Result<MessageId, BrokerError>;

    /// Lease up to `options.max_messages` available messages
    async fn receive(
        &self,
        queue: &QueueName,
        options: ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    /// Delete the message leased under `receipt`
    async fn delete(&self, queue: &QueueName, receipt: &ReceiptHandle) -> Result<(), BrokerError>;

    /// Approximate number of messages a receive could return
    async fn count_available(&self, queue: &QueueName) -> Result<u64, BrokerError>;
}

/// Outcome of one sweep over every queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Messages whose lease lapsed and that are available again
    pub returned: usize,
    /// Messages removed because they outlived the retention period
    pub purged: usize,
    /// Queues whose retention purge failed
    pub failed: usize,
}

/// Per-queue coordination state
struct QueueState {
    leases: LeaseManager,
    /// Wakes long-polling receivers when messages may have become available
    arrivals: Notify,
}

/// Orchestrates send, receive, delete and count across all queues
pub struct QueueCoordinator {
    store: Arc<dyn MessageStore>,
    codec: Arc<ReceiptCodec>,
    defaults: QueueDefaults,
    queues: DashMap<QueueName, Arc<QueueState>>,
    shutdown: watch::Sender<bool>,
}

impl QueueCoordinator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        codec: Arc<ReceiptCodec>,
        defaults: QueueDefaults,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            codec,
            defaults,
            queues: DashMap::new(),
            shutdown,
        }
    }

    /// Build a coordinator with the store and receipt key described by `config`
    pub async fn open(config: &BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let store = open_store(&config.storage).await?;
        let codec = ReceiptCodec::from_config(&config.receipts)?;

        info!(
            backend = store.backend(),
            queues = store.list_queues().len(),
            "Queue coordinator ready"
        );
        Ok(Self::new(store, Arc::new(codec), config.queue.clone()))
    }

    pub fn defaults(&self) -> &QueueDefaults {
        &self.defaults
    }

    /// Name of the message store backend
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    fn state(&self, queue: &QueueName) -> Result<Arc<QueueState>, BrokerError> {
        if let Some(state) = self.queues.get(queue) {
            return Ok(Arc::clone(state.value()));
        }

        if !self.store.contains_queue(queue) {
            return Err(BrokerError::QueueNotFound {
                queue_name: queue.to_string(),
            });
        }

        let state = self.queues.entry(queue.clone()).or_insert_with(|| {
            Arc::new(QueueState {
                leases: LeaseManager::new(queue.clone(), Arc::clone(&self.codec)),
                arrivals: Notify::new(),
            })
        });
        Ok(Arc::clone(state.value()))
    }

    // ========================================================================
    // Queue Lifecycle
    // ========================================================================

    /// Create a queue; returns `false` if it already existed
    pub async fn create_queue(&self, queue: &QueueName) -> Result<bool, BrokerError> {
        let created = self
            .store
            .create_queue(queue)
            .await
            .inspect_err(|e| log_failure("create_queue", queue, e))?;

        if created {
            info!(queue = %queue, "Created queue");
        }
        Ok(created)
    }

    /// Delete a queue with all of its messages and leases
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::QueueNotFound` if the queue does not exist.
    pub async fn delete_queue(&self, queue: &QueueName) -> Result<(), BrokerError> {
        if !self
            .store
            .delete_queue(queue)
            .await
            .inspect_err(|e| log_failure("delete_queue", queue, e))?
        {
            let err = BrokerError::QueueNotFound {
                queue_name: queue.to_string(),
            };
            log_failure("delete_queue", queue, &err);
            return Err(err);
        }

        if let Some((_, state)) = self.queues.remove(queue) {
            state.arrivals.notify_waiters();
        }
        info!(queue = %queue, "Deleted queue");
        Ok(())
    }

    pub fn list_queues(&self) -> Vec<QueueName> {
        self.store.list_queues()
    }

    // ========================================================================
    // Message Operations
    // ========================================================================

    /// Enqueue a message body and wake any long-polling receivers
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::MessageTooLarge` when the body exceeds the
    /// configured limit, `BrokerError::QueueNotFound` for unknown queues and
    /// `BrokerError::Storage` when persisting fails.
    pub async fn send(&self, queue: &QueueName, body: Bytes) -> Result<MessageId, BrokerError> {
        self.send_inner(queue, body)
            .await
            .inspect_err(|e| log_failure("send", queue, e))
    }

    async fn send_inner(&self, queue: &QueueName, body: Bytes) -> Result<MessageId, BrokerError> {
        if body.len() > self.defaults.max_message_size {
            return Err(BrokerError::MessageTooLarge {
                size: body.len(),
                max_size: self.defaults.max_message_size,
            });
        }

        let state = self.state(queue)?;
        let size = body.len();
        let message_id = self.store.enqueue(queue, body).await?;
        state.arrivals.notify_waiters();

        debug!(queue = %queue, message_id = %message_id, size, "Sent message");
        Ok(message_id)
    }

    /// Lease up to `options.max_messages` available messages, oldest first
    ///
    /// Returns an empty sequence when nothing is available. With a non-zero
    /// wait time the call suspends until a message arrives, the wait elapses
    /// or the coordinator shuts down.
    pub async fn receive(
        &self,
        queue: &QueueName,
        options: ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.receive_inner(queue, options)
            .await
            .inspect_err(|e| log_failure("receive", queue, e))
    }

    async fn receive_inner(
        &self,
        queue: &QueueName,
        options: ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let max_messages = options.max_messages;
        if max_messages == 0 || max_messages > self.defaults.max_messages_per_receive {
            return Err(ValidationError::OutOfRange {
                field: "max_messages".to_string(),
                message: format!(
                    "must be between 1 and {}",
                    self.defaults.max_messages_per_receive
                ),
            }
            .into());
        }

        let visibility = options
            .visibility_timeout
            .unwrap_or_else(|| self.defaults.visibility_timeout());
        check_duration(
            "visibility_timeout",
            visibility,
            self.defaults.max_visibility_timeout(),
        )?;
        check_duration("wait_time", options.wait_time, self.defaults.max_wait())?;

        let state = self.state(queue)?;
        let wait = options.wait_time.to_std().unwrap_or_default();
        let deadline = tokio::time::Instant::now() + wait;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            // Register interest before looking so a send in between is not missed
            let notified = state.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let received = self.lease_available(queue, &state, max_messages as usize, visibility)?;
            if !received.is_empty() || wait.is_zero() || *shutdown.borrow() {
                return Ok(received);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
                _ = shutdown.changed() => return Ok(Vec::new()),
            }
        }
    }

    fn lease_available(
        &self,
        queue: &QueueName,
        state: &QueueState,
        max_messages: usize,
        visibility: Duration,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let candidates = self
            .store
            .oldest(queue, max_messages, &|id| state.leases.is_leased(id))?;

        let mut received = Vec::with_capacity(candidates.len());
        for message in candidates {
            let lease = match state.leases.grant(&message.id, visibility) {
                Ok(lease) => lease,
                // Another receiver won the race for this message
                Err(BrokerError::AlreadyLeased { .. }) => continue,
                Err(e) => return Err(e),
            };

            if self.store.get(queue, &message.id)?.is_none() {
                // Deleted or purged between selection and grant
                state.leases.forget(&message.id);
                continue;
            }

            received.push(ReceivedMessage {
                message_id: message.id,
                body: message.body,
                receipt_handle: lease.receipt_handle,
                delivery_count: lease.delivery_count,
                enqueued_at: message.enqueued_at,
                visible_again_at: lease.visibility_deadline,
            });
        }

        if !received.is_empty() {
            debug!(queue = %queue, count = received.len(), "Leased messages");
        }
        Ok(received)
    }

    /// Permanently delete the message leased under `receipt`
    ///
    /// The delete is all-or-nothing: if removing the message from the store
    /// fails, the lease stays valid and the same receipt can be retried.
    ///
    /// # Errors
    ///
    /// - `BrokerError::InvalidReceipt` if the handle is malformed, was issued
    ///   for another queue, or no longer matches an active lease
    /// - `BrokerError::NotFound` if the message does not exist
    /// - `BrokerError::Storage` if the store could not remove the message
    pub async fn delete(&self, queue: &QueueName, receipt: &ReceiptHandle) -> Result<(), BrokerError> {
        self.delete_inner(queue, receipt)
            .await
            .inspect_err(|e| log_failure("delete", queue, e))
    }

    async fn delete_inner(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<(), BrokerError> {
        let message_id = self.open_receipt(queue, receipt)?;
        let state = self.state(queue)?;

        if self.store.get(queue, &message_id)?.is_none() {
            return Err(BrokerError::NotFound {
                message_id: message_id.to_string(),
            });
        }
        if !state.leases.validate(&message_id, receipt) {
            return Err(BrokerError::invalid_receipt(
                "receipt handle does not match an active lease",
            ));
        }

        let settlement = state.leases.settle(&message_id, receipt)?;
        self.store.remove(queue, &message_id).await?;
        settlement.commit();

        debug!(queue = %queue, message_id = %message_id, "Deleted message");
        Ok(())
    }

    /// Move the visibility deadline of a leased message to now + `timeout`
    ///
    /// A zero timeout makes the message available immediately. Returns the new
    /// deadline.
    pub async fn change_visibility(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<Timestamp, BrokerError> {
        self.change_visibility_inner(queue, receipt, timeout)
            .await
            .inspect_err(|e| log_failure("change_visibility", queue, e))
    }

    async fn change_visibility_inner(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<Timestamp, BrokerError> {
        check_duration(
            "visibility_timeout",
            timeout,
            self.defaults.max_visibility_timeout(),
        )?;
        let message_id = self.open_receipt(queue, receipt)?;
        let state = self.state(queue)?;

        if self.store.get(queue, &message_id)?.is_none() {
            return Err(BrokerError::NotFound {
                message_id: message_id.to_string(),
            });
        }

        let lease = state.leases.change_visibility(&message_id, receipt, timeout)?;
        if timeout.is_zero() {
            state.arrivals.notify_waiters();
        }

        debug!(queue = %queue, message_id = %message_id, "Changed message visibility");
        Ok(lease.visibility_deadline)
    }

    /// Approximate number of messages a receive could return right now
    pub async fn count_available(&self, queue: &QueueName) -> Result<u64, BrokerError> {
        self.stats(queue).await.map(|stats| stats.available)
    }

    /// Approximate available and in-flight counts
    pub async fn stats(&self, queue: &QueueName) -> Result<QueueStats, BrokerError> {
        self.stats_inner(queue)
            .inspect_err(|e| log_failure("count", queue, e))
    }

    fn stats_inner(&self, queue: &QueueName) -> Result<QueueStats, BrokerError> {
        let state = self.state(queue)?;
        let stored = self.store.count(queue)? as u64;
        let in_flight = (state.leases.in_flight() as u64).min(stored);
        Ok(QueueStats {
            available: stored - in_flight,
            in_flight,
        })
    }

    fn open_receipt(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
    ) -> Result<MessageId, BrokerError> {
        let claims = self.codec.open(receipt)?;
        if claims.queue != *queue {
            return Err(BrokerError::invalid_receipt(
                "receipt handle was issued for another queue",
            ));
        }
        Ok(claims.message_id)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Reclaim expired leases and purge messages past the retention period
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = Timestamp::now().plus(-self.defaults.message_retention());

        for queue in self.store.list_queues() {
            // Deleted since listing
            let Ok(state) = self.state(&queue) else {
                continue;
            };

            let returned = state.leases.sweep();
            if !returned.is_empty() {
                report.returned += returned.len();
                state.arrivals.notify_waiters();
            }

            match self.store.purge_before(&queue, &cutoff).await {
                Ok(purged) => {
                    for message_id in &purged {
                        state.leases.forget(message_id);
                    }
                    if !purged.is_empty() {
                        info!(queue = %queue, count = purged.len(), "Purged expired messages");
                    }
                    report.purged += purged.len();
                }
                Err(e) => {
                    log_failure("sweep", &queue, &e);
                    report.failed += 1;
                }
            }
        }

        if report.returned > 0 {
            debug!(returned = report.returned, "Returned expired leases");
        }
        report
    }

    /// Stop long polls and background sweeping
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Queue coordinator shutting down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receiver that flips to `true` on shutdown
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl std::fmt::Debug for QueueCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueCoordinator")
            .field("backend", &self.store.backend())
            .field("defaults", &self.defaults)
            .field("active_queues", &self.queues.len())
            .finish()
    }
}

#[async_trait]
impl QueueBroker for QueueCoordinator {
    async fn send(&self, queue: &QueueName, body: Bytes) -> Result<MessageId, BrokerError> {
        QueueCoordinator::send(self, queue, body).await
    }

    async fn receive(
        &self,
        queue: &QueueName,
        options: ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        QueueCoordinator::receive(self, queue, options).await
    }

    async fn delete(&self, queue: &QueueName, receipt: &ReceiptHandle) -> Result<(), BrokerError> {
        QueueCoordinator::delete(self, queue, receipt).await
    }

    async fn count_available(&self, queue: &QueueName) -> Result<u64, BrokerError> {
        QueueCoordinator::count_available(self, queue).await
    }
}

fn check_duration(field: &str, value: Duration, max: Duration) -> Result<(), ValidationError> {
    if value < Duration::zero() || value > max {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: format!("must be between 0 and {} seconds", max.num_seconds()),
        });
    }
    Ok(())
}

fn log_failure(operation: &'static str, queue: &QueueName, error: &BrokerError) {
    warn!(
        operation,
        queue = %queue,
        error_kind = %error.kind(),
        error = %error,
        "Queue operation failed"
    );
}
