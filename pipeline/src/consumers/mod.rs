//! Queue consumers: inventory, email, analytics, fraud.
//!
//! Each consumer is a [`MessageHandler`](orderflow_core::consumer::MessageHandler)
//! run by a `ConsumerWorker`. Delivery is at-least-once, so every consumer
//! deduplicates by [`Event::idempotency_key`] through an [`IdempotencyLedger`]:
//!
//! - a key already completed is acknowledged without repeating the effect
//! - a key another attempt is still working on fails transiently, so the
//!   message comes back after its visibility timeout instead of being
//!   acknowledged before the effect happened
//! - a fresh key is claimed; the claim is released if the attempt fails or
//!   is cancelled, and marked complete once the effect is applied

pub mod analytics;
pub mod email;
pub mod fraud;
pub mod inventory;

pub use analytics::{AnalyticsConsumer, CustomerStats, DailyMetrics};
pub use email::{EmailConsumer, EmailMessage};
pub use fraud::{FraudConsumer, FraudRules};
pub use inventory::InventoryConsumer;

use orderflow_core::consumer::ProcessingError;
use orderflow_core::event::Event;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyState {
    InProgress,
    Done,
}

/// What a consumer should do with a delivery.
pub enum Admission<'a> {
    /// First attempt for this key: apply the effect, then [`Claim::complete`].
    Fresh(Claim<'a>),
    /// The effect was already applied; acknowledge only.
    Duplicate,
}

/// Per-consumer record of processed idempotency keys.
#[derive(Debug, Default)]
pub struct IdempotencyLedger {
    keys: Mutex<HashMap<String, KeyState>>,
}

impl IdempotencyLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `event`'s key.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError::Transient`] while another attempt holds the
    /// claim.
    pub fn admit(&self, event: &Event) -> Result<Admission<'_>, ProcessingError> {
        let key = event.idempotency_key();
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        match keys.get(&key) {
            Some(KeyState::Done) => Ok(Admission::Duplicate),
            Some(KeyState::InProgress) => Err(ProcessingError::Transient(format!(
                "{key} is being processed by another attempt"
            ))),
            None => {
                keys.insert(key.clone(), KeyState::InProgress);
                Ok(Admission::Fresh(Claim {
                    ledger: self,
                    key,
                    completed: false,
                }))
            }
        }
    }

    /// Whether the effect for `key` was applied.
    #[must_use]
    pub fn is_done(&self, key: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            == Some(&KeyState::Done)
    }

    /// Number of completed keys.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| **s == KeyState::Done)
            .count()
    }

    fn finish(&self, key: &str, done: bool) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        if done {
            keys.insert(key.to_string(), KeyState::Done);
        } else {
            keys.remove(key);
        }
    }
}

/// Exclusive right to apply the effect for one key. Released on drop unless
/// completed.
pub struct Claim<'a> {
    ledger: &'a IdempotencyLedger,
    key: String,
    completed: bool,
}

impl Claim<'_> {
    /// Record that the effect was applied.
    pub fn complete(mut self) {
        self.completed = true;
        self.ledger.finish(&self.key, true);
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.ledger.finish(&self.key, false);
        }
    }
}

/// Required attribute, or [`ProcessingError::InvalidMessage`].
pub(crate) fn required_attribute<'a>(
    event: &'a Event,
    key: &str,
) -> Result<&'a str, ProcessingError> {
    event.attribute(key).ok_or_else(|| {
        ProcessingError::InvalidMessage(format!(
            "{} event for order {} lacks attribute '{key}'",
            event.event_type, event.order_id
        ))
    })
}

/// Parse a cents attribute.
pub(crate) fn cents_attribute(event: &Event, key: &str) -> Result<i64, ProcessingError> {
    let raw = required_attribute(event, key)?;
    raw.parse().map_err(|_| {
        ProcessingError::InvalidMessage(format!("attribute '{key}' is not an amount: {raw}"))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orderflow_core::event::EventType;

    fn event() -> Event {
        Event::new(EventType::OrderCreated, "o-1", "c-1", Utc::now())
    }

    #[test]
    fn completed_key_is_a_duplicate() {
        let ledger = IdempotencyLedger::new();
        match ledger.admit(&event()).unwrap() {
            Admission::Fresh(claim) => claim.complete(),
            Admission::Duplicate => unreachable!(),
        }
        assert!(matches!(ledger.admit(&event()), Ok(Admission::Duplicate)));
        assert!(ledger.is_done("o-1:order_created"));
    }

    #[test]
    fn concurrent_attempt_is_deferred() {
        let ledger = IdempotencyLedger::new();
        let first = ledger.admit(&event()).unwrap();
        assert!(matches!(ledger.admit(&event()), Err(ProcessingError::Transient(_))));
        drop(first);
    }

    #[test]
    fn dropped_claim_is_released() {
        let ledger = IdempotencyLedger::new();
        drop(ledger.admit(&event()).unwrap());
        assert!(matches!(ledger.admit(&event()), Ok(Admission::Fresh(_))));
        assert_eq!(ledger.completed(), 0);
    }
}
