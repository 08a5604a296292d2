//! # Orderflow Testing
//!
//! Testing utilities and helpers for the Orderflow pipeline.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - In-memory change-stream doubles ([`InMemoryChangeCheckpoint`],
//!   [`InMemoryChangeFeed`], [`RecordingChangeHandler`])
//! - A scriptable queue consumer ([`RecordingHandler`])
//! - proptest strategies for events ([`properties`])
//!
//! ## Example
//!
//! ```ignore
//! use orderflow_testing::ManualClock;
//!
//! let clock = Arc::new(ManualClock::new(test_clock().now()));
//! let queue = InMemoryQueue::with_clock("email", QueueConfig::default(), clock.clone());
//!
//! queue.dequeue(1, Duration::from_secs(30)).await?;
//! clock.advance(Duration::from_secs(31));
//! // the message is visible again
//! ```

use chrono::{DateTime, Utc};
use orderflow_core::environment::Clock;

mod change_stream_mocks;
mod handler_mocks;

pub use change_stream_mocks::{InMemoryChangeCheckpoint, InMemoryChangeFeed, RecordingChangeHandler};
pub use handler_mocks::RecordingHandler;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use chrono::TimeDelta;
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use orderflow_testing::mocks::FixedClock;
    /// use orderflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Share it as `Arc<ManualClock>` between a queue and the test driving it,
    /// then call [`ManualClock::advance`] to expire visibility deadlines.
    ///
    /// # Example
    ///
    /// ```
    /// use orderflow_testing::mocks::ManualClock;
    /// use orderflow_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::starting_at_test_epoch();
    /// let before = clock.now();
    /// clock.advance(Duration::from_secs(30));
    /// assert_eq!((clock.now() - before).num_seconds(), 30);
    /// ```
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Create a clock frozen at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Create a clock frozen at the [`test_clock`] instant.
        #[must_use]
        pub fn starting_at_test_epoch() -> Self {
            Self::new(test_clock().now())
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }

        /// Jump to an absolute instant.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use chrono::{DateTime, TimeDelta, Utc};
    use orderflow_core::event::{Event, EventType, attributes};
    use proptest::prelude::*;

    /// Any event type.
    pub fn event_type() -> impl Strategy<Value = EventType> {
        prop::sample::select(EventType::ALL.to_vec())
    }

    /// Payment methods seen on `order_created` events.
    pub fn payment_method() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["card", "paypal", "crypto", "bank_transfer"])
            .prop_map(str::to_string)
    }

    /// An event with an arbitrary type, ids, amount and payment method.
    pub fn event() -> impl Strategy<Value = Event> {
        (
            event_type(),
            "ord-[a-z0-9]{6}",
            prop_oneof!["cust-[a-z0-9]{4}", "new-[a-z0-9]{4}"],
            0u64..500_000,
            payment_method(),
            0i64..86_400,
        )
            .prop_map(|(event_type, order_id, customer_id, amount, method, offset)| {
                let timestamp = epoch() + TimeDelta::seconds(offset);
                Event::new(event_type, order_id, customer_id, timestamp)
                    .with_attribute(attributes::TOTAL_AMOUNT, amount.to_string())
                    .with_attribute(attributes::PAYMENT_METHOD, method)
            })
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(20_089)
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_advances_only_on_request() {
        let clock = ManualClock::starting_at_test_epoch();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_millis(1500));
        assert_eq!((clock.now() - start).num_milliseconds(), 1500);

        clock.set(start);
        assert_eq!(clock.now(), start);
    }
}
