//! Analytics consumer: daily and per-customer order aggregates.

use super::{Admission, IdempotencyLedger, cents_attribute};
use crate::types::Money;
use chrono::NaiveDate;
use orderflow_core::BoxFuture;
use orderflow_core::consumer::{MessageHandler, ProcessingError};
use orderflow_core::event::attributes;
use orderflow_core::queue::QueueMessage;
use orderflow_runtime::metrics::OrderMetrics;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

/// Orders and revenue for one UTC day.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DailyMetrics {
    /// Orders created that day
    pub orders: u64,
    /// Their combined total
    pub revenue: Money,
}

/// Lifetime figures for one customer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CustomerStats {
    /// Orders created
    pub orders: u64,
    /// Combined total
    pub lifetime_value: Money,
}

#[derive(Debug, Default)]
struct Aggregates {
    daily: BTreeMap<NaiveDate, DailyMetrics>,
    customers: HashMap<String, CustomerStats>,
}

/// Aggregates `order_created` events. Days are taken from the event timestamp.
#[derive(Debug, Default)]
pub struct AnalyticsConsumer {
    aggregates: Mutex<Aggregates>,
    ledger: IdempotencyLedger,
}

impl AnalyticsConsumer {
    /// Empty aggregates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics for `date`, zero if nothing was recorded.
    #[must_use]
    pub fn daily(&self, date: NaiveDate) -> DailyMetrics {
        self.aggregates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .daily
            .get(&date)
            .copied()
            .unwrap_or_default()
    }

    /// Stats for one customer.
    #[must_use]
    pub fn customer(&self, customer_id: &str) -> CustomerStats {
        self.aggregates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .customers
            .get(customer_id)
            .copied()
            .unwrap_or_default()
    }

    /// Orders and revenue across all days.
    #[must_use]
    pub fn totals(&self) -> DailyMetrics {
        self.aggregates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .daily
            .values()
            .fold(DailyMetrics::default(), |acc, day| DailyMetrics {
                orders: acc.orders + day.orders,
                revenue: acc.revenue + day.revenue,
            })
    }

    fn record(&self, message: &QueueMessage) -> Result<(), ProcessingError> {
        let event = &message.event;
        let amount = Money::from_cents(cents_attribute(event, attributes::TOTAL_AMOUNT)?);

        let Admission::Fresh(claim) = self.ledger.admit(event)? else {
            tracing::debug!(key = %event.idempotency_key(), "Order already counted");
            return Ok(());
        };

        let date = event.timestamp.date_naive();
        {
            let mut aggregates = self.aggregates.lock().unwrap_or_else(PoisonError::into_inner);
            let day = aggregates.daily.entry(date).or_default();
            day.orders += 1;
            day.revenue = day.revenue + amount;
            let customer = aggregates
                .customers
                .entry(event.customer_id.clone())
                .or_default();
            customer.orders += 1;
            customer.lifetime_value = customer.lifetime_value + amount;
        }
        claim.complete();

        OrderMetrics::record_revenue(u64::try_from(amount.cents()).unwrap_or(0));
        tracing::info!(
            order_id = %event.order_id,
            customer_id = %event.customer_id,
            amount = %amount,
            %date,
            "Order analytics recorded"
        );
        Ok(())
    }
}

impl MessageHandler for AnalyticsConsumer {
    fn name(&self) -> &str {
        "analytics"
    }

    fn handle<'a>(
        &'a self,
        message: &'a QueueMessage,
    ) -> BoxFuture<'a, Result<(), ProcessingError>> {
        Box::pin(async move { self.record(message) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use orderflow_core::environment::Clock;
    use orderflow_core::event::{Event, EventType};
    use orderflow_testing::test_clock;

    fn message(
        order_id: &str,
        customer: &str,
        cents: i64,
        at: chrono::DateTime<Utc>,
    ) -> QueueMessage {
        let event = Event::new(EventType::OrderCreated, order_id, customer, at)
            .with_attribute(attributes::TOTAL_AMOUNT, cents.to_string());
        QueueMessage::new(event, at)
    }

    #[tokio::test]
    async fn aggregates_per_day_and_customer() {
        let consumer = AnalyticsConsumer::new();
        let day_one = test_clock().now();
        let day_two = day_one + TimeDelta::days(1);

        consumer.handle(&message("o-1", "c-1", 7999, day_one)).await.unwrap();
        consumer.handle(&message("o-2", "c-2", 2999, day_one)).await.unwrap();
        consumer.handle(&message("o-3", "c-1", 1000, day_two)).await.unwrap();

        let first = consumer.daily(day_one.date_naive());
        assert_eq!(first.orders, 2);
        assert_eq!(first.revenue, Money::from_cents(10_998));
        assert_eq!(consumer.daily(day_two.date_naive()).orders, 1);

        let c1 = consumer.customer("c-1");
        assert_eq!(c1.orders, 2);
        assert_eq!(c1.lifetime_value, Money::from_cents(8999));
        assert_eq!(consumer.totals().revenue, Money::from_cents(11_998));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_counted_once() {
        let consumer = AnalyticsConsumer::new();
        let msg = message("o-1", "c-1", 500, test_clock().now());
        for _ in 0..3 {
            consumer.handle(&msg).await.unwrap();
        }
        assert_eq!(consumer.totals().orders, 1);
        assert_eq!(consumer.customer("c-1").lifetime_value, Money::from_cents(500));
    }
}
