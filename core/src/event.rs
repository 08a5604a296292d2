//! Order domain events and their wire format.
//!
//! Every order transition produces exactly one [`Event`]. Events are immutable
//! facts: once handed to the event bus they are only ever copied, never edited.
//!
//! # Wire format
//!
//! Events travel as JSON with a fixed envelope:
//!
//! ```json
//! {
//!   "type": "order_created",
//!   "order_id": "order-1",
//!   "customer_id": "cust-1",
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "attributes": { "total_amount": "15998" }
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use orderflow_core::event::{Event, EventType, attributes};
//! use chrono::Utc;
//!
//! let event = Event::new(EventType::OrderCreated, "order-1", "cust-1", Utc::now())
//!     .with_attribute(attributes::TOTAL_AMOUNT, "15998");
//!
//! assert_eq!(event.attribute(attributes::TOTAL_AMOUNT), Some("15998"));
//! assert_eq!(event.idempotency_key(), "order-1:order_created");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to JSON.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from JSON.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// Unknown event type encountered while parsing.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// Well-known attribute keys carried in [`Event::attributes`].
pub mod attributes {
    /// Order total in cents.
    pub const TOTAL_AMOUNT: &str = "total_amount";
    /// Number of line items in the order.
    pub const ITEM_COUNT: &str = "item_count";
    /// Line items as comma-separated `product_id:quantity` pairs.
    pub const ITEMS: &str = "items";
    /// Identifier returned by the payment gateway.
    pub const PAYMENT_ID: &str = "payment_id";
    /// Payment method used for the charge (`card`, `crypto`, ...).
    pub const PAYMENT_METHOD: &str = "payment_method";
    /// Why an order ended up failed.
    pub const FAILURE_REASON: &str = "failure_reason";
    /// Fraud risk score in `[0, 1]`.
    pub const FRAUD_SCORE: &str = "fraud_score";
    /// Shipment tracking reference.
    pub const TRACKING: &str = "tracking";
}

/// Type tag of an order event.
///
/// Subscription filters select events by this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Order was accepted and paid for.
    OrderCreated,
    /// Order cleared fraud review.
    OrderConfirmed,
    /// Order left the warehouse.
    OrderShipped,
    /// Order could not be completed (payment declined, timeout, cancellation).
    OrderFailed,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::OrderCreated,
        Self::OrderConfirmed,
        Self::OrderShipped,
        Self::OrderFailed,
    ];

    /// Stable wire name of this event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OrderCreated => "order_created",
            Self::OrderConfirmed => "order_confirmed",
            Self::OrderShipped => "order_shipped",
            Self::OrderFailed => "order_failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EventError::UnknownEventType(s.to_string()))
    }
}

/// A published order event.
///
/// The payload is a subset of the order snapshot: identifiers as typed fields,
/// everything else as string attributes so subscription filters can inspect
/// them without knowing the order schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Order this event describes.
    pub order_id: String,

    /// Customer who owns the order.
    pub customer_id: String,

    /// When the event was published.
    pub timestamp: DateTime<Utc>,

    /// Additional payload fields (see [`attributes`]).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    /// Create an event with no attributes.
    #[must_use]
    pub fn new(
        event_type: EventType,
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type,
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            timestamp,
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute, replacing any previous value under the same key.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Look up an attribute value.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Key that identifies this event across redeliveries.
    ///
    /// Each order transition emits one event, so `order_id:event_type` is
    /// unique per published event. Consumers use it to deduplicate.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.order_id, self.event_type)
    }

    /// Serialize to the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::SerializationError`] if encoding fails.
    pub fn to_json(&self) -> Result<String, EventError> {
        serde_json::to_string(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Parse from the JSON wire format.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] for malformed input or an
    /// unknown `type` tag.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        serde_json::from_str(json).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event {{ type: {}, order: {}, attributes: {} }}",
            self.event_type,
            self.order_id,
            self.attributes.len()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    fn fixed_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn event_type_wire_names() {
        assert_eq!(EventType::OrderCreated.as_str(), "order_created");
        assert_eq!(EventType::OrderConfirmed.to_string(), "order_confirmed");
        assert_eq!(
            "order_shipped".parse::<EventType>().unwrap(),
            EventType::OrderShipped
        );
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = "order_teleported".parse::<EventType>().unwrap_err();
        assert!(matches!(err, EventError::UnknownEventType(ref t) if t == "order_teleported"));
    }

    #[test]
    fn json_envelope_uses_type_key_and_rfc3339_timestamp() {
        let event = Event::new(EventType::OrderFailed, "order-9", "cust-1", fixed_time())
            .with_attribute(attributes::FAILURE_REASON, "payment_timeout");

        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "order_failed");
        assert_eq!(json["order_id"], "order-9");
        assert_eq!(json["customer_id"], "cust-1");
        assert_eq!(json["timestamp"], "2025-01-01T00:00:00Z");
        assert_eq!(json["attributes"]["failure_reason"], "payment_timeout");
    }

    #[test]
    fn parses_event_without_attributes() {
        let json = r#"{
            "type": "order_created",
            "order_id": "o-1",
            "customer_id": "c-1",
            "timestamp": "2025-01-01T00:00:00Z"
        }"#;
        let event = Event::from_json(json).unwrap();

        assert_eq!(event.event_type, EventType::OrderCreated);
        assert!(event.attributes.is_empty());
    }

    #[test]
    fn malformed_json_is_a_deserialization_error() {
        let err = Event::from_json(r#"{"type":"nope"}"#).unwrap_err();
        assert!(matches!(err, EventError::DeserializationError(_)));
    }

    #[test]
    fn idempotency_key_distinguishes_event_types() {
        let created = Event::new(EventType::OrderCreated, "o-1", "c-1", fixed_time());
        let shipped = Event::new(EventType::OrderShipped, "o-1", "c-1", fixed_time());

        assert_ne!(created.idempotency_key(), shipped.idempotency_key());
    }
}
