//! Consumer contract: handlers that turn queued events into side effects.
//!
//! A consumer never talks to the event bus. It is reached only through its
//! [`DurableQueue`](crate::queue::DurableQueue): a worker dequeues a batch,
//! calls the [`MessageHandler`] once per message and acknowledges each message
//! whose handler returned `Ok`. Failed messages stay unacknowledged and are
//! redelivered after their visibility timeout.
//!
//! # Idempotency
//!
//! Delivery is at-least-once, and a redelivery after a missed timeout may even
//! overlap with a still-running first attempt. Handlers must therefore produce
//! the same observable state whether a message is processed once or several
//! times; [`Event::idempotency_key`](crate::event::Event::idempotency_key) is
//! the natural deduplication key.

use crate::BoxFuture;
use crate::queue::QueueMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Identifier of a consumer (and of its subscription).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Creates a new `ConsumerId` from a string
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConsumerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Consumer-local processing failure.
///
/// Every variant leaves the message unacknowledged; the queue redelivers it
/// until the delivery limit is reached and then dead-letters it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    /// A dependency failed; a later attempt may succeed.
    #[error("Transient processing failure: {0}")]
    Transient(String),

    /// The message cannot be processed as-is (unknown order, bad attribute).
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The handler exceeded its processing budget.
    #[error("Processing timed out after {0:?}")]
    Timeout(Duration),
}

/// Processes one queued message.
///
/// # Dyn Compatibility
///
/// Returns a boxed future so workers can hold `Arc<dyn MessageHandler>`.
pub trait MessageHandler: Send + Sync {
    /// Handler name (used in logs and metrics).
    fn name(&self) -> &str;

    /// Perform the side effect for `message`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError`] when the side effect did not complete; the
    /// message will be redelivered.
    fn handle<'a>(
        &'a self,
        message: &'a QueueMessage,
    ) -> BoxFuture<'a, Result<(), ProcessingError>>;
}
