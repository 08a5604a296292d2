//! Event bus abstraction: publish once, fan out to every matching subscription.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ Order Processor │
//! └────────┬────────┘
//!          │ publish(event)
//!          ▼
//! ┌─────────────────┐
//! │    Event Bus    │──── filter per subscription
//! └────────┬────────┘
//!     ┌────┴─────┬───────────┬──────────┐
//!     ▼          ▼           ▼          ▼
//! ┌────────┐ ┌───────┐ ┌───────────┐ ┌───────┐
//! │inventory│ │ email │ │ analytics │ │ fraud │   durable queues
//! └────────┘ └───────┘ └───────────┘ └───────┘
//! ```
//!
//! # Key Principles
//!
//! - **Enqueued before return**: `publish` resolves only after every matching
//!   subscription's enqueue completed or failed
//! - **No cross-queue atomicity**: a failure on one queue does not roll back
//!   the copies already enqueued on others
//! - **At-least-once delivery**: consumers must deduplicate
//! - **Explicit configuration**: the subscription set is handed to the bus at
//!   construction and never changes afterwards

use crate::BoxFuture;
use crate::consumer::ConsumerId;
use crate::event::{Event, EventType};
use crate::filter::SubscriptionFilter;
use crate::queue::{DurableQueue, MessageId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// A consumer's standing interest in a class of events.
#[derive(Clone)]
pub struct Subscription {
    /// Consumer that owns the target queue.
    pub consumer: ConsumerId,
    /// Which events this consumer wants.
    pub filter: SubscriptionFilter,
    /// Where matching events are enqueued.
    pub queue: Arc<dyn DurableQueue>,
}

impl Subscription {
    /// Create a subscription.
    #[must_use]
    pub fn new(
        consumer: impl Into<ConsumerId>,
        filter: SubscriptionFilter,
        queue: Arc<dyn DurableQueue>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            filter,
            queue,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer", &self.consumer)
            .field("filter", &self.filter)
            .field("queue", &self.queue.name())
            .finish()
    }
}

/// The static subscription set passed to an event bus at construction.
///
/// # Example
///
/// ```ignore
/// let subscriptions = Subscriptions::new()
///     .subscribe("analytics", SubscriptionFilter::event_types([EventType::OrderCreated]), analytics_queue)
///     .subscribe("email", SubscriptionFilter::event_types([EventType::OrderShipped]), email_queue);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Subscriptions {
    entries: Vec<Subscription>,
}

impl Subscriptions {
    /// Empty subscription set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription.
    ///
    /// Consumer ids are unique: registering an id again replaces the earlier
    /// subscription.
    #[must_use]
    pub fn subscribe(
        mut self,
        consumer: impl Into<ConsumerId>,
        filter: SubscriptionFilter,
        queue: Arc<dyn DurableQueue>,
    ) -> Self {
        let subscription = Subscription::new(consumer, filter, queue);
        self.entries.retain(|s| s.consumer != subscription.consumer);
        self.entries.push(subscription);
        self
    }

    /// Look up a subscription by consumer id.
    #[must_use]
    pub fn get(&self, consumer: &ConsumerId) -> Option<&Subscription> {
        self.entries.iter().find(|s| &s.consumer == consumer)
    }

    /// All subscriptions, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no subscription is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One successful enqueue during a publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Subscriber that received the copy.
    pub consumer: ConsumerId,
    /// Id of the message in the subscriber's queue.
    pub message_id: MessageId,
}

/// One failed enqueue during a publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnqueueFailure {
    /// Subscriber whose queue rejected the copy.
    pub consumer: ConsumerId,
    /// Why the enqueue failed.
    pub reason: String,
    /// Whether the enqueue ran out of time rather than failing outright.
    pub timed_out: bool,
}

/// Outcome of a fully successful publish.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishResult {
    /// Subscribers that received a copy.
    pub delivered: Vec<Delivery>,
    /// Subscribers whose filter rejected the event.
    pub filtered_out: Vec<ConsumerId>,
}

impl PublishResult {
    /// Whether `consumer` received a copy.
    #[must_use]
    pub fn delivered_to(&self, consumer: &ConsumerId) -> bool {
        self.delivered.iter().any(|d| &d.consumer == consumer)
    }

    /// Number of queues the event was copied into.
    #[must_use]
    pub fn fan_out(&self) -> usize {
        self.delivered.len()
    }
}

/// At least one matching subscription did not get its copy.
///
/// Copies already enqueued elsewhere stay enqueued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Publish of {event_type} for order {order_id} failed for {} of {} subscriptions",
    .failures.len(),
    .failures.len() + .delivered.len()
)]
pub struct PublishError {
    /// Order the event describes.
    pub order_id: String,
    /// Type of the event that was published.
    pub event_type: EventType,
    /// Copies that made it.
    pub delivered: Vec<Delivery>,
    /// Copies that did not.
    pub failures: Vec<EnqueueFailure>,
}

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// Uses boxed futures so the processor can hold `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Copy `event` into the queue of every subscription whose filter matches.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] when any matching subscription's enqueue
    /// failed or timed out. Successful copies are not rolled back.
    fn publish<'a>(
        &'a self,
        event: &'a Event,
    ) -> BoxFuture<'a, Result<PublishResult, PublishError>>;
}
