//! Email consumer: renders customer notifications into an outbox.

use super::{Admission, IdempotencyLedger, cents_attribute};
use crate::types::Money;
use orderflow_core::BoxFuture;
use orderflow_core::consumer::{MessageHandler, ProcessingError};
use orderflow_core::event::{Event, EventType, attributes};
use orderflow_core::queue::QueueMessage;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};

/// Default sender address.
pub const DEFAULT_FROM_EMAIL: &str = "noreply@ecommerce-demo.com";

/// A rendered notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    /// Recipient
    pub to: String,
    /// Sender
    pub from: String,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub body: String,
    /// Order the email is about
    pub order_id: String,
    /// Event that triggered it
    pub event_type: EventType,
}

/// Sends one email per distinct event. "Sending" appends to an in-memory outbox.
#[derive(Debug)]
pub struct EmailConsumer {
    from: String,
    outbox: Mutex<Vec<EmailMessage>>,
    ledger: IdempotencyLedger,
}

impl EmailConsumer {
    /// Consumer sending from `from`.
    #[must_use]
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            outbox: Mutex::new(Vec::new()),
            ledger: IdempotencyLedger::new(),
        }
    }

    /// Emails sent so far, oldest first.
    #[must_use]
    pub fn outbox(&self) -> Vec<EmailMessage> {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Emails sent for one order.
    #[must_use]
    pub fn sent_for(&self, order_id: &str) -> Vec<EmailMessage> {
        self.outbox()
            .into_iter()
            .filter(|m| m.order_id == order_id)
            .collect()
    }

    /// Render the email for `event`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessingError::InvalidMessage`] when a template field is missing.
    pub fn render(&self, event: &Event) -> Result<EmailMessage, ProcessingError> {
        let order_id = &event.order_id;
        let (subject, body) = match event.event_type {
            EventType::OrderCreated => {
                let total = Money::from_cents(cents_attribute(event, attributes::TOTAL_AMOUNT)?);
                (
                    format!("Order Confirmation - {order_id}"),
                    format!(
                        "Thank you for your order!\n\nOrder ID: {order_id}\nTotal: {total}\n\n\
                         We'll send you a shipping notification soon."
                    ),
                )
            }
            EventType::OrderConfirmed => {
                let total = Money::from_cents(cents_attribute(event, attributes::TOTAL_AMOUNT)?);
                (
                    format!("Payment Confirmed - {order_id}"),
                    format!(
                        "Your payment has been confirmed!\n\n\
                         Order ID: {order_id}\nTotal: {total}\n\n\
                         Your order is being prepared for shipping."
                    ),
                )
            }
            EventType::OrderShipped => {
                let tracking = event.attribute(attributes::TRACKING).unwrap_or("pending");
                (
                    format!("Order Shipped - {order_id}"),
                    format!(
                        "Your order has been shipped!\n\n\
                         Order ID: {order_id}\nTracking: {tracking}\n\n\
                         Expected delivery: 3-5 business days"
                    ),
                )
            }
            EventType::OrderFailed => (
                format!("Order Update - {order_id}"),
                format!("Order {order_id} - Status: {}", event.event_type),
            ),
        };

        Ok(EmailMessage {
            to: format!("{}@example.com", event.customer_id),
            from: self.from.clone(),
            subject,
            body,
            order_id: order_id.clone(),
            event_type: event.event_type,
        })
    }

    fn send(&self, message: &QueueMessage) -> Result<(), ProcessingError> {
        let event = &message.event;
        let email = self.render(event)?;

        let Admission::Fresh(claim) = self.ledger.admit(event)? else {
            tracing::debug!(key = %event.idempotency_key(), "Email already sent");
            return Ok(());
        };
        tracing::info!(to = %email.to, subject = %email.subject, "Email sent");
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(email);
        claim.complete();
        Ok(())
    }
}

impl Default for EmailConsumer {
    fn default() -> Self {
        Self::new(DEFAULT_FROM_EMAIL)
    }
}

impl MessageHandler for EmailConsumer {
    fn name(&self) -> &str {
        "email"
    }

    fn handle<'a>(
        &'a self,
        message: &'a QueueMessage,
    ) -> BoxFuture<'a, Result<(), ProcessingError>> {
        Box::pin(async move { self.send(message) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use orderflow_core::environment::Clock;
    use orderflow_testing::test_clock;

    fn message(event_type: EventType) -> QueueMessage {
        let event = Event::new(event_type, "o-1", "cust-7", test_clock().now())
            .with_attribute(attributes::TOTAL_AMOUNT, "15998")
            .with_attribute(attributes::TRACKING, "TRACK-12345");
        QueueMessage::new(event, test_clock().now())
    }

    #[tokio::test]
    async fn renders_templates_per_event_type() {
        let consumer = EmailConsumer::default();
        consumer.handle(&message(EventType::OrderConfirmed)).await.unwrap();
        consumer.handle(&message(EventType::OrderShipped)).await.unwrap();

        let outbox = consumer.outbox();
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox[0].subject, "Payment Confirmed - o-1");
        assert!(outbox[0].body.contains("Total: $159.98"));
        assert_eq!(outbox[0].to, "cust-7@example.com");
        assert_eq!(outbox[0].from, DEFAULT_FROM_EMAIL);
        assert_eq!(outbox[1].subject, "Order Shipped - o-1");
        assert!(outbox[1].body.contains("Tracking: TRACK-12345"));
    }

    #[tokio::test]
    async fn duplicate_delivery_sends_once() {
        let consumer = EmailConsumer::new("orders@shop.test");
        let msg = message(EventType::OrderShipped);
        consumer.handle(&msg).await.unwrap();
        consumer.handle(&msg).await.unwrap();
        assert_eq!(consumer.sent_for("o-1").len(), 1);
    }

    #[test]
    fn failed_orders_get_the_fallback_template() {
        let consumer = EmailConsumer::default();
        let email = consumer.render(&message(EventType::OrderFailed).event).unwrap();
        assert_eq!(email.subject, "Order Update - o-1");
        assert_eq!(email.body, "Order o-1 - Status: order_failed");
    }

    #[test]
    fn missing_total_is_invalid() {
        let consumer = EmailConsumer::default();
        let event = Event::new(EventType::OrderCreated, "o-1", "c-1", test_clock().now());
        assert!(matches!(consumer.render(&event), Err(ProcessingError::InvalidMessage(_))));
    }
}
