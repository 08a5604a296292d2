//! Durable queue contract with visibility-timeout redelivery.
//!
//! Each subscription owns one [`DurableQueue`]. The event bus enqueues copies
//! of matching events; a consumer worker drains the queue.
//!
//! # Message lifecycle
//!
//! ```text
//!            enqueue
//!               │
//!               ▼
//!          ┌─────────┐   dequeue    ┌───────────┐  acknowledge  ┌──────────────┐
//!          │ Pending │ ───────────► │ Delivered │ ────────────► │ Acknowledged │
//!          └─────────┘              └─────┬─────┘               └──────────────┘
//!               ▲   visibility timeout    │
//!               └─────────────────────────┤
//!                                         │ timeout after max deliveries
//!                                         ▼
//!                                  ┌──────────────┐
//!                                  │ DeadLettered │
//!                                  └──────────────┘
//! ```
//!
//! # Delivery guarantees
//!
//! - **At-least-once**: a message is redelivered until acknowledged or dead-lettered
//! - **Exclusive within the timeout**: a delivered message is invisible to every
//!   other consumer until its visibility deadline passes
//! - **Best-effort FIFO**: redelivered messages rejoin the back of the queue
//!
//! # Receipts
//!
//! Every delivery hands out a [`Receipt`] naming the message and the delivery
//! attempt. Acknowledging or extending with a receipt from an earlier attempt
//! fails with [`QueueError::StaleReceipt`]: once a lock has expired and the
//! message went to someone else, the original worker no longer owns it.

use crate::BoxFuture;
use crate::event::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of a queued message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap an existing identifier.
    #[must_use]
    pub const fn new(id: String) -> Self {
        Self(id)
    }

    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("msg-{}", Uuid::new_v4()))
    }

    /// Returns the inner string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of one delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Receipt {
    /// Message that was delivered.
    pub message_id: MessageId,
    /// Delivery attempt (1 for the first delivery).
    pub attempt: u32,
}

/// Acknowledgment state of a queued message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Waiting to be delivered (first time or after a visibility timeout).
    Pending,
    /// Handed to a consumer and hidden until the visibility deadline.
    Delivered,
    /// Processed successfully and removed from the queue.
    Acknowledged,
    /// Exceeded the delivery limit and moved to the dead-letter store.
    DeadLettered,
}

/// A message as stored in, and returned from, a durable queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueMessage {
    /// Message identifier.
    pub id: MessageId,

    /// Copy of the published event.
    pub event: Event,

    /// Number of times this message has been delivered.
    pub delivery_count: u32,

    /// When the message entered the queue.
    pub enqueued_at: DateTime<Utc>,

    /// Visibility deadline: the message is hidden until this instant.
    pub visible_at: DateTime<Utc>,

    /// Current acknowledgment state.
    pub state: DeliveryState,
}

impl QueueMessage {
    /// Create a pending message that is visible immediately.
    #[must_use]
    pub fn new(event: Event, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::generate(),
            event,
            delivery_count: 0,
            enqueued_at: now,
            visible_at: now,
            state: DeliveryState::Pending,
        }
    }

    /// Receipt for the current delivery attempt.
    #[must_use]
    pub fn receipt(&self) -> Receipt {
        Receipt {
            message_id: self.id.clone(),
            attempt: self.delivery_count,
        }
    }

    /// Whether the message may be handed out at `now`.
    #[must_use]
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }
}

/// Point-in-time counts for a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting to be delivered.
    pub visible: usize,
    /// Messages delivered and not yet acknowledged.
    pub in_flight: usize,
    /// Messages moved to the dead-letter store.
    pub dead_lettered: usize,
}

impl QueueStats {
    /// Messages still owed to the consumer (visible + in flight).
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.visible + self.in_flight
    }
}

/// Errors from durable queue operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity; the enqueue may succeed later.
    #[error("Queue '{queue}' is full (capacity {capacity})")]
    Full {
        /// Queue name
        queue: String,
        /// Configured capacity
        capacity: usize,
    },

    /// No message with this id is in the queue (already acknowledged or dead-lettered).
    #[error("Unknown message: {0}")]
    UnknownMessage(MessageId),

    /// The receipt belongs to an earlier delivery attempt.
    #[error("Stale receipt for message {message_id}: attempt {attempt}, current attempt {current}")]
    StaleReceipt {
        /// Message the receipt refers to
        message_id: MessageId,
        /// Attempt recorded in the receipt
        attempt: u32,
        /// Current delivery attempt
        current: u32,
    },

    /// The message is not currently delivered (its visibility already expired).
    #[error("Message {0} is not in flight")]
    NotInFlight(MessageId),

    /// Storage or transport failure.
    #[error("Queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Full { .. } | Self::Backend(_))
    }
}

/// Durable, at-least-once message queue.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so queues can be shared as
/// `Arc<dyn DurableQueue>` between the event bus and consumer workers.
pub trait DurableQueue: Send + Sync {
    /// Queue name (used in logs, metrics and dead-letter entries).
    fn name(&self) -> &str;

    /// Append a copy of `event` as a new pending message.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Full`] when a capacity bound is reached, or
    /// [`QueueError::Backend`] on storage failure.
    fn enqueue(&self, event: Event) -> BoxFuture<'_, Result<MessageId, QueueError>>;

    /// Deliver up to `max` visible messages and hide them for `visibility_timeout`.
    ///
    /// Each returned message has its delivery count already incremented;
    /// use [`QueueMessage::receipt`] to acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] on storage failure.
    fn dequeue(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> BoxFuture<'_, Result<Vec<QueueMessage>, QueueError>>;

    /// Acknowledge a delivery, removing the message for good.
    ///
    /// # Errors
    ///
    /// - [`QueueError::UnknownMessage`] if the message is gone
    /// - [`QueueError::StaleReceipt`] if the message was redelivered since
    /// - [`QueueError::NotInFlight`] if the visibility deadline already passed
    fn acknowledge(&self, receipt: Receipt) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Push the visibility deadline of an in-flight delivery to `now + timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`DurableQueue::acknowledge`].
    fn extend_visibility(
        &self,
        receipt: Receipt,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), QueueError>>;

    /// Current message counts.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] on storage failure.
    fn stats(&self) -> BoxFuture<'_, Result<QueueStats, QueueError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use chrono::TimeDelta;

    #[test]
    fn new_message_is_pending_and_visible() {
        let now = Utc::now();
        let message = QueueMessage::new(Event::new(EventType::OrderCreated, "o", "c", now), now);

        assert_eq!(message.state, DeliveryState::Pending);
        assert_eq!(message.delivery_count, 0);
        assert!(message.is_visible(now));
        assert!(!message.is_visible(now - TimeDelta::seconds(1)));
    }

    #[test]
    fn receipt_tracks_delivery_attempt() {
        let now = Utc::now();
        let mut message =
            QueueMessage::new(Event::new(EventType::OrderCreated, "o", "c", now), now);
        message.delivery_count = 3;

        let receipt = message.receipt();
        assert_eq!(receipt.attempt, 3);
        assert_eq!(receipt.message_id, message.id);
    }

    #[test]
    fn only_capacity_and_backend_errors_are_transient() {
        assert!(
            QueueError::Full {
                queue: "q".into(),
                capacity: 1
            }
            .is_transient()
        );
        assert!(QueueError::Backend("io".into()).is_transient());
        assert!(!QueueError::UnknownMessage(MessageId::generate()).is_transient());
    }

    #[test]
    fn depth_counts_visible_and_in_flight() {
        let stats = QueueStats {
            visible: 2,
            in_flight: 3,
            dead_lettered: 7,
        };
        assert_eq!(stats.depth(), 5);
    }
}
