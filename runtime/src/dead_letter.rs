//! Dead-letter store for messages that exhausted their deliveries.
//!
//! A queue moves a message here once its visibility timeout expires after
//! `max_delivery_count` deliveries. Entries are kept for investigation and can
//! be resolved, discarded, or redriven to their source queue.
//!
//! ```text
//!  add ──► Pending ──redrive──► Processing ──enqueued──► Resolved
//!             │                      │
//!             │                      └──enqueue failed──► Pending
//!             ├──mark_resolved──► Resolved
//!             └──mark_discarded──► Discarded
//! ```

use chrono::{DateTime, Utc};
use orderflow_core::environment::{Clock, SystemClock};
use orderflow_core::event::Event;
use orderflow_core::queue::{DurableQueue, MessageId, QueueError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Status of an entry in the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Waiting for investigation or redrive
    Pending,
    /// A redrive is in progress
    Processing,
    /// Redriven or fixed by hand
    Resolved,
    /// Permanently dropped
    Discarded,
}

impl DeadLetterStatus {
    /// Lowercase name, as used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }
}

/// Errors from dead-letter store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// No entry with this id
    #[error("Dead letter {0} not found")]
    NotFound(u64),

    /// The operation needs a pending entry
    #[error("Dead letter {id} is {}, expected pending", .status.as_str())]
    NotPending {
        /// Entry id
        id: u64,
        /// Current status
        status: DeadLetterStatus,
    },

    /// Redrive target is not the queue the entry came from
    #[error("Dead letter {id} belongs to queue '{expected}', not '{actual}'")]
    WrongQueue {
        /// Entry id
        id: u64,
        /// Source queue of the entry
        expected: String,
        /// Queue passed to redrive
        actual: String,
    },

    /// Re-enqueueing failed; the entry is pending again
    #[error("Redrive of dead letter {id} failed: {source}")]
    Redrive {
        /// Entry id
        id: u64,
        /// Underlying queue error
        source: QueueError,
    },
}

/// A message that exhausted its deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMessage {
    /// Store-assigned id
    pub id: u64,

    /// Queue the message was dead-lettered from
    pub queue: String,

    /// Id the message had in that queue
    pub message_id: MessageId,

    /// The event copy
    pub event: Event,

    /// Why the message was dead-lettered
    pub error_message: String,

    /// Deliveries made before giving up
    pub delivery_count: u32,

    /// When the message entered its queue
    pub enqueued_at: DateTime<Utc>,

    /// When the message first landed here
    pub first_failed_at: DateTime<Utc>,

    /// When the message most recently landed here
    pub last_failed_at: DateTime<Utc>,

    /// Current status
    pub status: DeadLetterStatus,

    /// When the entry was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved it
    pub resolved_by: Option<String>,

    /// Resolution or discard notes
    pub resolution_notes: Option<String>,
}

#[derive(Debug, Default)]
struct Entries {
    next_id: u64,
    by_id: BTreeMap<u64, FailedMessage>,
}

/// In-memory dead-letter store, shareable between queues.
///
/// # Example
///
/// ```ignore
/// let dlq = Arc::new(DeadLetterStore::new());
/// let queue = InMemoryQueue::new("email", QueueConfig::default()).with_dead_letters(dlq.clone());
///
/// for entry in dlq.list_pending(100) {
///     dlq.redrive(entry.id, &queue).await?;
/// }
/// ```
pub struct DeadLetterStore {
    entries: Mutex<Entries>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for DeadLetterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterStore")
            .field("entries", &self.lock().by_id.len())
            .finish_non_exhaustive()
    }
}

impl Default for DeadLetterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadLetterStore {
    /// Empty store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store reading time from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a failed message and return its entry id.
    ///
    /// A message that was redriven and failed again gets a new entry.
    pub fn add(
        &self,
        queue: &str,
        message_id: MessageId,
        event: Event,
        enqueued_at: DateTime<Utc>,
        delivery_count: u32,
        error_message: impl Into<String>,
    ) -> u64 {
        let now = self.clock.now();
        let error_message = error_message.into();
        let mut entries = self.lock();
        entries.next_id += 1;
        let id = entries.next_id;

        tracing::warn!(
            dlq_id = id,
            queue,
            message_id = %message_id,
            order_id = %event.order_id,
            event_type = %event.event_type,
            delivery_count,
            error = %error_message,
            "Message added to dead-letter store"
        );

        entries.by_id.insert(
            id,
            FailedMessage {
                id,
                queue: queue.to_string(),
                message_id,
                event,
                error_message,
                delivery_count,
                enqueued_at,
                first_failed_at: now,
                last_failed_at: now,
                status: DeadLetterStatus::Pending,
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
            },
        );
        id
    }

    /// Oldest pending entries, up to `limit`.
    #[must_use]
    pub fn list_pending(&self, limit: usize) -> Vec<FailedMessage> {
        self.list_by_status(DeadLetterStatus::Pending, limit)
    }

    /// Oldest entries with `status`, up to `limit`.
    #[must_use]
    pub fn list_by_status(&self, status: DeadLetterStatus, limit: usize) -> Vec<FailedMessage> {
        self.lock()
            .by_id
            .values()
            .filter(|e| e.status == status)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Look up an entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] for an unknown id.
    pub fn get(&self, id: u64) -> Result<FailedMessage, DeadLetterError> {
        self.lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(DeadLetterError::NotFound(id))
    }

    /// Mark a pending entry as fixed by hand.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] or [`DeadLetterError::NotPending`].
    pub fn mark_resolved(
        &self,
        id: u64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        self.close(id, DeadLetterStatus::Resolved, resolved_by, notes)?;
        tracing::info!(dlq_id = id, resolved_by, "Dead letter resolved");
        metrics::counter!("dead_letter_resolved_total").increment(1);
        Ok(())
    }

    /// Mark a pending entry as permanently dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::NotFound`] or [`DeadLetterError::NotPending`].
    pub fn mark_discarded(&self, id: u64, reason: &str) -> Result<(), DeadLetterError> {
        self.close(id, DeadLetterStatus::Discarded, "operator", Some(reason))?;
        tracing::warn!(dlq_id = id, reason, "Dead letter discarded");
        metrics::counter!("dead_letter_discarded_total").increment(1);
        Ok(())
    }

    /// Number of pending entries.
    #[must_use]
    pub fn count_pending(&self) -> usize {
        self.lock()
            .by_id
            .values()
            .filter(|e| e.status == DeadLetterStatus::Pending)
            .count()
    }

    /// Number of pending entries from `queue`.
    #[must_use]
    pub fn count_pending_for(&self, queue: &str) -> usize {
        self.lock()
            .by_id
            .values()
            .filter(|e| e.status == DeadLetterStatus::Pending && e.queue == queue)
            .count()
    }

    /// Send a pending entry back to its source queue as a fresh message.
    ///
    /// The entry is `Processing` while the enqueue runs, `Resolved` after it
    /// succeeds, and `Pending` again if it fails.
    ///
    /// # Errors
    ///
    /// - [`DeadLetterError::NotFound`] / [`DeadLetterError::NotPending`]
    /// - [`DeadLetterError::WrongQueue`] if `queue` is not the source queue
    /// - [`DeadLetterError::Redrive`] if the enqueue fails
    pub async fn redrive(
        &self,
        id: u64,
        queue: &dyn DurableQueue,
    ) -> Result<MessageId, DeadLetterError> {
        let event = {
            let mut entries = self.lock();
            let entry = entries
                .by_id
                .get_mut(&id)
                .ok_or(DeadLetterError::NotFound(id))?;
            if entry.status != DeadLetterStatus::Pending {
                return Err(DeadLetterError::NotPending {
                    id,
                    status: entry.status,
                });
            }
            if entry.queue != queue.name() {
                return Err(DeadLetterError::WrongQueue {
                    id,
                    expected: entry.queue.clone(),
                    actual: queue.name().to_string(),
                });
            }
            entry.status = DeadLetterStatus::Processing;
            entry.event.clone()
        };

        let result = queue.enqueue(event).await;

        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries
            .by_id
            .get_mut(&id)
            .ok_or(DeadLetterError::NotFound(id))?;
        match result {
            Ok(message_id) => {
                entry.status = DeadLetterStatus::Resolved;
                entry.resolved_at = Some(now);
                entry.resolved_by = Some("redrive".to_string());
                entry.resolution_notes = Some(format!("redriven as {message_id}"));
                tracing::info!(
                    dlq_id = id,
                    queue = %entry.queue,
                    message_id = %message_id,
                    "Dead letter redriven"
                );
                metrics::counter!("dead_letter_redriven_total").increment(1);
                Ok(message_id)
            }
            Err(source) => {
                entry.status = DeadLetterStatus::Pending;
                entry.last_failed_at = now;
                tracing::warn!(dlq_id = id, error = %source, "Dead letter redrive failed");
                Err(DeadLetterError::Redrive { id, source })
            }
        }
    }

    fn close(
        &self,
        id: u64,
        status: DeadLetterStatus,
        by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries
            .by_id
            .get_mut(&id)
            .ok_or(DeadLetterError::NotFound(id))?;
        if entry.status != DeadLetterStatus::Pending {
            return Err(DeadLetterError::NotPending {
                id,
                status: entry.status,
            });
        }
        entry.status = status;
        entry.resolved_at = Some(now);
        entry.resolved_by = Some(by.to_string());
        entry.resolution_notes = notes.map(str::to_string);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use orderflow_core::event::EventType;

    fn add_one(store: &DeadLetterStore, queue: &str) -> u64 {
        let now = Utc::now();
        store.add(
            queue,
            MessageId::generate(),
            Event::new(EventType::OrderCreated, "o-1", "c-1", now),
            now,
            3,
            "visibility timeout expired",
        )
    }

    #[test]
    fn resolve_and_discard_only_pending_entries() {
        let store = DeadLetterStore::new();
        let a = add_one(&store, "email");
        let b = add_one(&store, "email");
        assert_eq!(store.count_pending(), 2);

        store.mark_resolved(a, "alice", Some("fixed template")).unwrap();
        store.mark_discarded(b, "customer deleted").unwrap();

        assert_eq!(store.count_pending(), 0);
        assert_eq!(store.get(a).unwrap().status, DeadLetterStatus::Resolved);
        assert_eq!(
            store.mark_resolved(b, "bob", None),
            Err(DeadLetterError::NotPending {
                id: b,
                status: DeadLetterStatus::Discarded
            })
        );
    }

    #[test]
    fn counts_pending_per_queue() {
        let store = DeadLetterStore::new();
        add_one(&store, "email");
        add_one(&store, "fraud");
        add_one(&store, "fraud");

        assert_eq!(store.count_pending_for("fraud"), 2);
        assert_eq!(store.count_pending_for("inventory"), 0);
        assert_eq!(store.list_pending(1).len(), 1);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = DeadLetterStore::new();
        assert_eq!(store.get(99), Err(DeadLetterError::NotFound(99)));
    }
}
