//! # Orderflow Core
//!
//! Core types and traits for the Orderflow fan-out event pipeline.
//!
//! An order submission is persisted, charged, and announced as a domain
//! [`Event`](event::Event). The [`EventBus`](event_bus::EventBus) copies each
//! event into the [`DurableQueue`](queue::DurableQueue) of every subscription
//! whose [`SubscriptionFilter`](filter::SubscriptionFilter) accepts it, and
//! independent consumers drain their queues through a
//! [`MessageHandler`](consumer::MessageHandler). Separately, a change-stream
//! processor follows the order store's [`ChangeFeed`](change_stream::ChangeFeed).
//!
//! ## Architecture Principles
//!
//! - At-least-once delivery everywhere; consumers deduplicate
//! - Dyn-compatible traits at every seam (`Arc<dyn Trait>`)
//! - Time is injected through [`environment::Clock`]
//!
//! This crate holds only contracts and pure logic. In-memory implementations
//! live in `orderflow-runtime`.

use std::future::Future;
use std::pin::Pin;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod change_stream;
pub mod consumer;
pub mod event;
pub mod event_bus;
pub mod filter;
pub mod queue;

/// Boxed, sendable future returned by the dyn-compatible traits of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Environment module - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Queues compute visibility deadlines and dead-letter timestamps from it,
    /// so tests can drive redelivery without sleeping.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
