//! Lease tracking for in-flight messages.
//!
//! A [`LeaseManager`] belongs to exactly one queue. It records which messages
//! are leased, until when, and under which receipt handle. It never touches
//! the message store; the coordinator always consults the store first.
//!
//! Each message has one slot guarded by its map entry, so every transition on
//! a message (grant, release, settle, sweep) is serialised while transitions
//! on different messages proceed independently.

use crate::error::BrokerError;
use crate::message::{MessageId, QueueName, ReceiptHandle, Timestamp};
use crate::receipt::ReceiptCodec;
use chrono::Duration;
use dashmap::DashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::debug;

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;

/// Temporary exclusive claim on a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub granted_at: Timestamp,
    pub visibility_deadline: Timestamp,
    /// Number of times the message has been leased, including this one
    pub delivery_count: u32,
}

impl Lease {
    /// Check whether the lease has lapsed at `now`
    pub fn is_expired_at(&self, now: &Timestamp) -> bool {
        *now >= self.visibility_deadline
    }

    fn is_held_by(&self, handle: &ReceiptHandle, now: &Timestamp) -> bool {
        !self.is_expired_at(now) && handles_match(&self.receipt_handle, handle)
    }
}

fn handles_match(expected: &ReceiptHandle, presented: &ReceiptHandle) -> bool {
    expected
        .as_str()
        .as_bytes()
        .ct_eq(presented.as_str().as_bytes())
        .into()
}

#[derive(Debug)]
enum SlotState {
    Idle,
    Leased(Lease),
    /// Pinned by a delete that has not finished removing the message
    Settling(Lease),
}

#[derive(Debug)]
struct Slot {
    deliveries: u32,
    state: SlotState,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            deliveries: 0,
            state: SlotState::Idle,
        }
    }
}

/// Tracks the leases of one queue
pub struct LeaseManager {
    queue: QueueName,
    codec: Arc<ReceiptCodec>,
    slots: DashMap<MessageId, Slot>,
}

impl LeaseManager {
    pub fn new(queue: QueueName, codec: Arc<ReceiptCodec>) -> Self {
        Self {
            queue,
            codec,
            slots: DashMap::new(),
        }
    }

    /// Lease a message for `visibility_timeout`
    ///
    /// An expired lease that has not been swept yet is replaced, which
    /// invalidates its handle.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::AlreadyLeased` if the message holds an active
    /// lease or is being deleted.
    pub fn grant(
        &self,
        message_id: &MessageId,
        visibility_timeout: Duration,
    ) -> Result<Lease, BrokerError> {
        let now = Timestamp::now();
        let mut slot = self.slots.entry(message_id.clone()).or_default();

        match &slot.state {
            SlotState::Leased(lease) if !lease.is_expired_at(&now) => {
                return Err(BrokerError::AlreadyLeased {
                    message_id: message_id.to_string(),
                });
            }
            SlotState::Settling(_) => {
                return Err(BrokerError::AlreadyLeased {
                    message_id: message_id.to_string(),
                });
            }
            SlotState::Idle | SlotState::Leased(_) => {}
        }

        slot.deliveries = slot.deliveries.saturating_add(1);
        let lease = Lease {
            message_id: message_id.clone(),
            receipt_handle: self.codec.issue(&self.queue, message_id),
            granted_at: now.clone(),
            visibility_deadline: now.plus(visibility_timeout),
            delivery_count: slot.deliveries,
        };
        slot.state = SlotState::Leased(lease.clone());

        debug!(
            queue = %self.queue,
            message_id = %message_id,
            delivery_count = lease.delivery_count,
            visibility_deadline = %lease.visibility_deadline,
            "Granted lease"
        );
        Ok(lease)
    }

    /// Check that `handle` belongs to the current, unexpired lease
    pub fn validate(&self, message_id: &MessageId, handle: &ReceiptHandle) -> bool {
        let now = Timestamp::now();
        self.slots
            .get(message_id)
            .map(|slot| match &slot.state {
                SlotState::Leased(lease) => lease.is_held_by(handle, &now),
                SlotState::Idle | SlotState::Settling(_) => false,
            })
            .unwrap_or(false)
    }

    /// End a lease early, making the message available again
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::InvalidReceipt` unless `handle` matches an
    /// active lease.
    pub fn release(&self, message_id: &MessageId, handle: &ReceiptHandle) -> Result<(), BrokerError> {
        let now = Timestamp::now();
        let mut slot = self
            .slots
            .get_mut(message_id)
            .ok_or_else(stale_receipt)?;

        let held =
            matches!(&slot.state, SlotState::Leased(lease) if lease.is_held_by(handle, &now));
        if !held {
            return Err(stale_receipt());
        }

        slot.state = SlotState::Idle;
        debug!(queue = %self.queue, message_id = %message_id, "Released lease");
        Ok(())
    }

    /// Pin a valid lease for deletion
    ///
    /// While the returned settlement is alive the message cannot be granted,
    /// validated, or swept. Committing forgets the message; dropping the
    /// settlement without committing restores the lease untouched.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::InvalidReceipt` unless `handle` matches an
    /// active lease.
    pub fn settle(
        &self,
        message_id: &MessageId,
        handle: &ReceiptHandle,
    ) -> Result<Settlement<'_>, BrokerError> {
        let now = Timestamp::now();
        let mut slot = self
            .slots
            .get_mut(message_id)
            .ok_or_else(stale_receipt)?;

        let state = std::mem::replace(&mut slot.state, SlotState::Idle);
        match state {
            SlotState::Leased(lease) if lease.is_held_by(handle, &now) => {
                slot.state = SlotState::Settling(lease);
                Ok(Settlement {
                    manager: self,
                    message_id: message_id.clone(),
                    committed: false,
                })
            }
            other => {
                slot.state = other;
                Err(stale_receipt())
            }
        }
    }

    /// Move the deadline of a valid lease to now + `timeout`
    ///
    /// A zero timeout releases the lease; the returned lease then carries a
    /// deadline of now.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::InvalidReceipt` unless `handle` matches an
    /// active lease.
    pub fn change_visibility(
        &self,
        message_id: &MessageId,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<Lease, BrokerError> {
        let now = Timestamp::now();
        let mut slot = self
            .slots
            .get_mut(message_id)
            .ok_or_else(stale_receipt)?;

        let state = std::mem::replace(&mut slot.state, SlotState::Idle);
        match state {
            SlotState::Leased(mut lease) if lease.is_held_by(handle, &now) => {
                lease.visibility_deadline = now.plus(timeout);
                if timeout > Duration::zero() {
                    slot.state = SlotState::Leased(lease.clone());
                }

                debug!(
                    queue = %self.queue,
                    message_id = %message_id,
                    visibility_deadline = %lease.visibility_deadline,
                    "Changed lease visibility"
                );
                Ok(lease)
            }
            other => {
                slot.state = other;
                Err(stale_receipt())
            }
        }
    }

    /// Return every message whose lease has lapsed to the available state
    pub fn sweep(&self) -> Vec<MessageId> {
        let now = Timestamp::now();
        let mut expired = Vec::new();

        for mut slot in self.slots.iter_mut() {
            let lapsed = matches!(&slot.state, SlotState::Leased(lease) if lease.is_expired_at(&now));
            if lapsed {
                slot.state = SlotState::Idle;
                expired.push(slot.key().clone());
            }
        }

        if !expired.is_empty() {
            debug!(queue = %self.queue, count = expired.len(), "Swept expired leases");
        }
        expired
    }

    /// Check whether a receive must skip this message
    pub fn is_leased(&self, message_id: &MessageId) -> bool {
        let now = Timestamp::now();
        self.slots
            .get(message_id)
            .map(|slot| match &slot.state {
                SlotState::Leased(lease) => !lease.is_expired_at(&now),
                SlotState::Settling(_) => true,
                SlotState::Idle => false,
            })
            .unwrap_or(false)
    }

    /// Number of messages currently held by a consumer
    pub fn in_flight(&self) -> usize {
        let now = Timestamp::now();
        self.slots
            .iter()
            .filter(|slot| match &slot.state {
                SlotState::Leased(lease) => !lease.is_expired_at(&now),
                SlotState::Settling(_) => true,
                SlotState::Idle => false,
            })
            .count()
    }

    /// Drop all state for a message that no longer exists
    pub fn forget(&self, message_id: &MessageId) {
        self.slots.remove(message_id);
    }

    /// Times the message has been leased so far
    pub fn deliveries(&self, message_id: &MessageId) -> u32 {
        self.slots
            .get(message_id)
            .map(|slot| slot.deliveries)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("queue", &self.queue)
            .field("tracked", &self.slots.len())
            .finish()
    }
}

fn stale_receipt() -> BrokerError {
    BrokerError::invalid_receipt("receipt handle does not match an active lease")
}

/// A lease pinned for deletion
///
/// Must be committed once the message has been removed from the store.
#[must_use = "dropping a settlement restores the lease"]
pub struct Settlement<'a> {
    manager: &'a LeaseManager,
    message_id: MessageId,
    committed: bool,
}

impl Settlement<'_> {
    /// Forget the message's lease state for good
    pub fn commit(mut self) {
        self.manager.slots.remove(&self.message_id);
        self.committed = true;
    }
}

impl Drop for Settlement<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        if let Some(mut slot) = self.manager.slots.get_mut(&self.message_id) {
            let state = std::mem::replace(&mut slot.state, SlotState::Idle);
            slot.state = match state {
                SlotState::Settling(lease) => SlotState::Leased(lease),
                other => other,
            };
            debug!(
                queue = %self.manager.queue,
                message_id = %self.message_id,
                "Restored lease after unfinished delete"
            );
        }
    }
}
