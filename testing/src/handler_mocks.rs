#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use orderflow_core::BoxFuture;
use orderflow_core::consumer::{MessageHandler, ProcessingError};
use orderflow_core::queue::{MessageId, QueueMessage};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::Duration;

/// Queue consumer that records what it saw and fails on demand.
///
/// Every call is recorded in [`RecordingHandler::attempts`]. Successful calls
/// are also deduplicated by idempotency key into
/// [`RecordingHandler::effects`], which is what an idempotent consumer's
/// observable state looks like.
///
/// # Example
///
/// ```ignore
/// let handler = RecordingHandler::new("email").failing_first(2);
/// // first two calls return ProcessingError::Transient, the third succeeds
/// ```
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    delay: Option<Duration>,
    fail_first: RwLock<usize>,
    failing_orders: RwLock<HashSet<String>>,
    attempts: RwLock<Vec<(MessageId, u32)>>,
    effects: RwLock<HashMap<String, usize>>,
}

impl RecordingHandler {
    /// Handler that succeeds on every message.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: None,
            fail_first: RwLock::new(0),
            failing_orders: RwLock::new(HashSet::new()),
            attempts: RwLock::new(Vec::new()),
            effects: RwLock::new(HashMap::new()),
        }
    }

    /// Fail the first `count` calls with a transient error.
    #[must_use]
    pub fn failing_first(self, count: usize) -> Self {
        *self.fail_first.write().unwrap() = count;
        self
    }

    /// Sleep for `delay` (tokio time) before completing each call.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Always fail messages for `order_id`.
    pub fn fail_order(&self, order_id: impl Into<String>) {
        self.failing_orders.write().unwrap().insert(order_id.into());
    }

    /// Stop failing messages for `order_id`.
    pub fn heal_order(&self, order_id: &str) {
        self.failing_orders.write().unwrap().remove(order_id);
    }

    /// Every call as `(message id, delivery count)`, in call order.
    #[must_use]
    pub fn attempts(&self) -> Vec<(MessageId, u32)> {
        self.attempts.read().unwrap().clone()
    }

    /// Number of calls for `message_id`.
    #[must_use]
    pub fn attempts_for(&self, message_id: &MessageId) -> usize {
        self.attempts
            .read()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == message_id)
            .count()
    }

    /// Distinct idempotency keys processed successfully.
    #[must_use]
    pub fn effect_count(&self) -> usize {
        self.effects.read().unwrap().len()
    }

    /// How many times the effect for `key` was requested (duplicates included).
    #[must_use]
    pub fn times_seen(&self, key: &str) -> usize {
        self.effects.read().unwrap().get(key).copied().unwrap_or(0)
    }
}

impl MessageHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(
        &'a self,
        message: &'a QueueMessage,
    ) -> BoxFuture<'a, Result<(), ProcessingError>> {
        Box::pin(async move {
            self.attempts
                .write()
                .unwrap()
                .push((message.id.clone(), message.delivery_count));

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            {
                let mut remaining = self.fail_first.write().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProcessingError::Transient(format!(
                        "scripted failure, {} left",
                        *remaining
                    )));
                }
            }

            if self
                .failing_orders
                .read()
                .unwrap()
                .contains(&message.event.order_id)
            {
                return Err(ProcessingError::Transient(format!(
                    "order {} is failing",
                    message.event.order_id
                )));
            }

            *self
                .effects
                .write()
                .unwrap()
                .entry(message.event.idempotency_key())
                .or_insert(0) += 1;
            Ok(())
        })
    }
}
