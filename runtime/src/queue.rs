//! In-memory [`DurableQueue`] with visibility timeouts and dead-lettering.
//!
//! Pending messages sit in a FIFO; delivered messages move to an in-flight
//! table keyed by message id with their visibility deadline. Every operation
//! first reclaims in-flight messages whose deadline has passed: they rejoin
//! the back of the FIFO, or go to the [`DeadLetterStore`] once they have been
//! delivered `max_delivery_count` times.
//!
//! Time comes from an injected [`Clock`], so tests drive redelivery with a
//! manual clock instead of sleeping.

use crate::dead_letter::DeadLetterStore;
use crate::metrics::QueueMetrics;
use chrono::{DateTime, TimeDelta, Utc};
use orderflow_core::BoxFuture;
use orderflow_core::environment::{Clock, SystemClock};
use orderflow_core::event::Event;
use orderflow_core::queue::{
    DeliveryState, DurableQueue, MessageId, QueueError, QueueMessage, QueueStats, Receipt,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Configuration for an [`InMemoryQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Deliveries allowed before an unacknowledged message is dead-lettered.
    pub max_delivery_count: u32,

    /// Maximum number of messages held (visible + in flight). `None` is unbounded.
    pub capacity: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_delivery_count: 3,
            capacity: None,
        }
    }
}

impl QueueConfig {
    /// Set the delivery limit (at least 1).
    #[must_use]
    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count.max(1);
        self
    }

    /// Bound the queue.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueueMessage>,
    in_flight: HashMap<MessageId, QueueMessage>,
    dead_lettered: usize,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }
}

/// Visibility-timeout queue held in memory.
///
/// # Example
///
/// ```ignore
/// let queue = InMemoryQueue::new("analytics", QueueConfig::default());
/// queue.enqueue(event).await?;
///
/// for message in queue.dequeue(10, Duration::from_secs(30)).await? {
///     // process...
///     queue.acknowledge(message.receipt()).await?;
/// }
/// ```
pub struct InMemoryQueue {
    name: String,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    dead_letters: Arc<DeadLetterStore>,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InMemoryQueue {
    /// Queue using the system clock and a private dead-letter store.
    #[must_use]
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Queue reading time from `clock`.
    #[must_use]
    pub fn with_clock(name: impl Into<String>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            dead_letters: Arc::new(DeadLetterStore::with_clock(Arc::clone(&clock))),
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Send dead letters to a shared store instead of a private one.
    #[must_use]
    pub fn with_dead_letters(mut self, store: Arc<DeadLetterStore>) -> Self {
        self.dead_letters = store;
        self
    }

    /// Dead-letter store this queue writes to.
    #[must_use]
    pub const fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    /// Queue configuration.
    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Lock the state and reclaim expired deliveries as of `now`.
    fn lock_at(&self, now: DateTime<Utc>) -> MutexGuard<'_, QueueState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.reclaim_expired(&mut state, now);
        state
    }

    fn reclaim_expired(&self, state: &mut QueueState, now: DateTime<Utc>) {
        let mut expired: Vec<MessageId> = state
            .in_flight
            .values()
            .filter(|m| m.is_visible(now))
            .map(|m| m.id.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        // Oldest deadline first keeps redeliveries in FIFO order.
        expired.sort_by_key(|id| state.in_flight.get(id).map(|m| (m.visible_at, m.enqueued_at)));

        for id in expired {
            let Some(mut message) = state.in_flight.remove(&id) else {
                continue;
            };
            if message.delivery_count >= self.config.max_delivery_count {
                message.state = DeliveryState::DeadLettered;
                state.dead_lettered += 1;
                QueueMetrics::record_dead_letter(&self.name);
                self.dead_letters.add(
                    &self.name,
                    message.id,
                    message.event,
                    message.enqueued_at,
                    message.delivery_count,
                    format!(
                        "not acknowledged after {} deliveries",
                        message.delivery_count
                    ),
                );
            } else {
                tracing::warn!(
                    queue = %self.name,
                    message_id = %message.id,
                    order_id = %message.event.order_id,
                    delivery_count = message.delivery_count,
                    "Visibility timeout expired, message will be redelivered"
                );
                QueueMetrics::record_redelivery(&self.name);
                message.state = DeliveryState::Pending;
                state.pending.push_back(message);
            }
        }
    }

    /// Validate that `receipt` names the current, unexpired delivery.
    fn check_receipt<'s>(
        state: &'s mut QueueState,
        receipt: &Receipt,
    ) -> Result<&'s mut QueueMessage, QueueError> {
        if state.in_flight.contains_key(&receipt.message_id) {
            let message = state
                .in_flight
                .get_mut(&receipt.message_id)
                .ok_or_else(|| QueueError::UnknownMessage(receipt.message_id.clone()))?;
            if message.delivery_count != receipt.attempt {
                return Err(QueueError::StaleReceipt {
                    message_id: receipt.message_id.clone(),
                    attempt: receipt.attempt,
                    current: message.delivery_count,
                });
            }
            return Ok(message);
        }

        match state.pending.iter().find(|m| m.id == receipt.message_id) {
            Some(message) if message.delivery_count > receipt.attempt => {
                Err(QueueError::StaleReceipt {
                    message_id: receipt.message_id.clone(),
                    attempt: receipt.attempt,
                    current: message.delivery_count,
                })
            }
            Some(_) => Err(QueueError::NotInFlight(receipt.message_id.clone())),
            None => Err(QueueError::UnknownMessage(receipt.message_id.clone())),
        }
    }
}

fn deadline(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl DurableQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, event: Event) -> BoxFuture<'_, Result<MessageId, QueueError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.lock_at(now);

            if let Some(capacity) = self.config.capacity {
                if state.depth() >= capacity {
                    return Err(QueueError::Full {
                        queue: self.name.clone(),
                        capacity,
                    });
                }
            }

            let message = QueueMessage::new(event, now);
            let id = message.id.clone();
            tracing::debug!(
                queue = %self.name,
                message_id = %id,
                event_type = %message.event.event_type,
                order_id = %message.event.order_id,
                "Message enqueued"
            );
            state.pending.push_back(message);
            QueueMetrics::record_depth(&self.name, state.depth());
            Ok(id)
        })
    }

    fn dequeue(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> BoxFuture<'_, Result<Vec<QueueMessage>, QueueError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let visible_at = deadline(now, visibility_timeout);
            let mut state = self.lock_at(now);

            let take = max.min(state.pending.len());
            let mut delivered = Vec::with_capacity(take);
            for mut message in state.pending.drain(..take).collect::<Vec<_>>() {
                message.delivery_count += 1;
                message.visible_at = visible_at;
                message.state = DeliveryState::Delivered;
                state.in_flight.insert(message.id.clone(), message.clone());
                delivered.push(message);
            }

            if !delivered.is_empty() {
                QueueMetrics::record_deliveries(&self.name, delivered.len());
            }
            Ok(delivered)
        })
    }

    fn acknowledge(&self, receipt: Receipt) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            let mut state = self.lock_at(self.clock.now());
            Self::check_receipt(&mut state, &receipt)?;
            state.in_flight.remove(&receipt.message_id);

            tracing::debug!(
                queue = %self.name,
                message_id = %receipt.message_id,
                attempt = receipt.attempt,
                "Message acknowledged"
            );
            QueueMetrics::record_ack(&self.name);
            QueueMetrics::record_depth(&self.name, state.depth());
            Ok(())
        })
    }

    fn extend_visibility(
        &self,
        receipt: Receipt,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<(), QueueError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut state = self.lock_at(now);
            let message = Self::check_receipt(&mut state, &receipt)?;
            message.visible_at = deadline(now, timeout);
            Ok(())
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<QueueStats, QueueError>> {
        Box::pin(async move {
            let state = self.lock_at(self.clock.now());
            Ok(QueueStats {
                visible: state.pending.len(),
                in_flight: state.in_flight.len(),
                dead_lettered: state.dead_lettered,
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use orderflow_core::event::EventType;
    use orderflow_testing::ManualClock;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn queue(config: QueueConfig) -> (InMemoryQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_at_test_epoch());
        let queue = InMemoryQueue::with_clock("test", config, clock.clone());
        (queue, clock)
    }

    fn event(order_id: &str) -> Event {
        Event::new(EventType::OrderCreated, order_id, "cust-1", Utc::now())
    }

    #[tokio::test]
    async fn delivered_message_is_hidden_until_timeout() {
        let (queue, clock) = queue(QueueConfig::default());
        queue.enqueue(event("o-1")).await.unwrap();

        let first = queue.dequeue(10, VISIBILITY).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_count, 1);
        assert!(queue.dequeue(10, VISIBILITY).await.unwrap().is_empty());

        clock.advance(VISIBILITY);
        let second = queue.dequeue(10, VISIBILITY).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn acknowledged_message_is_never_redelivered() {
        let (queue, clock) = queue(QueueConfig::default());
        queue.enqueue(event("o-1")).await.unwrap();

        let message = queue.dequeue(1, VISIBILITY).await.unwrap().remove(0);
        queue.acknowledge(message.receipt()).await.unwrap();

        clock.advance(VISIBILITY * 10);
        assert!(queue.dequeue(10, VISIBILITY).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().depth(), 0);
    }

    #[tokio::test]
    async fn stale_receipt_cannot_acknowledge() {
        let (queue, clock) = queue(QueueConfig::default());
        queue.enqueue(event("o-1")).await.unwrap();

        let first = queue.dequeue(1, VISIBILITY).await.unwrap().remove(0);
        clock.advance(VISIBILITY);
        let second = queue.dequeue(1, VISIBILITY).await.unwrap().remove(0);

        let err = queue.acknowledge(first.receipt()).await.unwrap_err();
        assert_eq!(
            err,
            QueueError::StaleReceipt {
                message_id: first.id.clone(),
                attempt: 1,
                current: 2
            }
        );
        queue.acknowledge(second.receipt()).await.unwrap();
    }

    #[tokio::test]
    async fn expired_receipt_is_not_in_flight() {
        let (queue, clock) = queue(QueueConfig::default());
        queue.enqueue(event("o-1")).await.unwrap();

        let message = queue.dequeue(1, VISIBILITY).await.unwrap().remove(0);
        clock.advance(VISIBILITY + Duration::from_secs(1));

        assert_eq!(
            queue.acknowledge(message.receipt()).await,
            Err(QueueError::NotInFlight(message.id.clone()))
        );
    }

    #[tokio::test]
    async fn extend_visibility_keeps_message_hidden() {
        let (queue, clock) = queue(QueueConfig::default());
        queue.enqueue(event("o-1")).await.unwrap();

        let message = queue.dequeue(1, VISIBILITY).await.unwrap().remove(0);
        clock.advance(Duration::from_secs(20));
        queue
            .extend_visibility(message.receipt(), VISIBILITY)
            .await
            .unwrap();
        clock.advance(Duration::from_secs(20));

        assert!(queue.dequeue(1, VISIBILITY).await.unwrap().is_empty());
        queue.acknowledge(message.receipt()).await.unwrap();
    }

    #[tokio::test]
    async fn dead_letters_after_max_deliveries() {
        let (queue, clock) = queue(QueueConfig::default().with_max_delivery_count(3));
        queue.enqueue(event("o-1")).await.unwrap();

        for attempt in 1..=3 {
            let batch = queue.dequeue(1, VISIBILITY).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch[0].delivery_count, attempt);
            clock.advance(VISIBILITY);
        }

        assert!(queue.dequeue(1, VISIBILITY).await.unwrap().is_empty());
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.depth(), 0);

        let entries = queue.dead_letters().list_pending(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].delivery_count, 3);
        assert_eq!(entries[0].event.order_id, "o-1");
    }

    #[tokio::test]
    async fn redrive_enqueues_fresh_message() {
        let (queue, clock) = queue(QueueConfig::default().with_max_delivery_count(1));
        queue.enqueue(event("o-1")).await.unwrap();
        queue.dequeue(1, VISIBILITY).await.unwrap();
        clock.advance(VISIBILITY);
        queue.stats().await.unwrap();

        let entry = queue.dead_letters().list_pending(1).remove(0);
        queue.dead_letters().redrive(entry.id, &queue).await.unwrap();

        let redelivered = queue.dequeue(1, VISIBILITY).await.unwrap().remove(0);
        assert_eq!(redelivered.delivery_count, 1);
        assert_ne!(redelivered.id, entry.message_id);
        assert_eq!(queue.dead_letters().count_pending(), 0);
    }

    #[tokio::test]
    async fn capacity_bound_rejects_with_transient_error() {
        let (queue, _clock) = queue(QueueConfig::default().with_capacity(1));
        queue.enqueue(event("o-1")).await.unwrap();

        let err = queue.enqueue(event("o-2")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, QueueError::Full { capacity: 1, .. }));
    }

    #[tokio::test]
    async fn redelivered_messages_rejoin_the_back() {
        let (queue, clock) = queue(QueueConfig::default());
        queue.enqueue(event("o-1")).await.unwrap();
        queue.dequeue(1, VISIBILITY).await.unwrap();
        queue.enqueue(event("o-2")).await.unwrap();

        clock.advance(VISIBILITY);
        let batch = queue.dequeue(10, VISIBILITY).await.unwrap();
        let order: Vec<_> = batch.iter().map(|m| m.event.order_id.as_str()).collect();
        assert_eq!(order, vec!["o-2", "o-1"]);
    }
}
