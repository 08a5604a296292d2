//! Core domain types for the order pipeline.
//!
//! Orders progress through states: Created → (Confirmed → (Shipped | Failed) | Failed).
//! `Shipped` and `Failed` are terminal. Every transition is announced as one
//! [`Event`].

use chrono::{DateTime, Utc};
use orderflow_core::change_stream::Diff;
use orderflow_core::event::{Event, EventType, attributes};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::Add;

/// Unique identifier for an order
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(String);

impl OrderId {
    /// Creates a new `OrderId` from a string
    #[must_use]
    pub const fn new(id: String) -> Self {
        Self(id)
    }

    /// Fresh random order id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("order-{}", uuid::Uuid::new_v4()))
    }

    /// Returns the inner string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Unique identifier for a customer
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomerId(String);

impl CustomerId {
    /// Creates a new `CustomerId` from a string
    #[must_use]
    pub const fn new(id: String) -> Self {
        Self(id)
    }

    /// Returns the inner string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CustomerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Money amount in cents (to avoid floating point issues)
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Creates a new money amount from cents
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Creates a new money amount from dollars (converted to cents)
    #[must_use]
    pub const fn from_dollars(dollars: i64) -> Self {
        Self(dollars * 100)
    }

    /// Returns the value in cents
    #[must_use]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns the value in dollars (as floating point)
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // i64 to f64 precision loss is acceptable for display
    pub fn dollars(&self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Multiply by a quantity, saturating at the `i64` bounds.
    #[must_use]
    pub const fn times(self, quantity: u32) -> Self {
        Self(self.0.saturating_mul(quantity as i64))
    }

    /// Multiply by a quantity, or `None` on overflow.
    #[must_use]
    pub const fn checked_times(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as i64) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Add, or `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, rhs: Self) -> Option<Self> {
        match self.0.checked_add(rhs.0) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.2}", self.dollars())
    }
}

/// A line item in an order, priced at order time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// Product identifier
    pub product_id: String,
    /// Product name
    pub name: String,
    /// Quantity ordered
    pub quantity: u32,
    /// Price per unit
    pub unit_price: Money,
}

impl LineItem {
    /// Creates a new line item
    #[must_use]
    pub const fn new(product_id: String, name: String, quantity: u32, unit_price: Money) -> Self {
        Self {
            product_id,
            name,
            quantity,
            unit_price,
        }
    }

    /// Calculates the total price for this line item
    #[must_use]
    pub const fn total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// Encode `(product_id, quantity)` pairs for the [`attributes::ITEMS`] attribute.
#[must_use]
pub fn encode_items(items: &[LineItem]) -> String {
    items
        .iter()
        .map(|item| format!("{}:{}", item.product_id, item.quantity))
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse an [`attributes::ITEMS`] value. `None` if any pair is malformed.
#[must_use]
pub fn parse_items(encoded: &str) -> Option<Vec<(String, u32)>> {
    if encoded.is_empty() {
        return Some(Vec::new());
    }
    encoded
        .split(',')
        .map(|pair| {
            let (product_id, quantity) = pair.rsplit_once(':')?;
            let quantity = quantity.parse().ok()?;
            (!product_id.is_empty()).then(|| (product_id.to_string(), quantity))
        })
        .collect()
}

/// Status of an order in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Persisted, payment not settled yet
    Created,
    /// Paid
    Confirmed,
    /// Left the warehouse
    Shipped,
    /// Payment declined or timed out, or cancelled after payment
    Failed,
}

impl OrderStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Confirmed => "confirmed",
            Self::Shipped => "shipped",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition is allowed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Shipped | Self::Failed)
    }

    /// Whether `self → next` is an allowed transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Confirmed | Self::Failed)
                | (Self::Confirmed, Self::Shipped | Self::Failed)
        )
    }

    /// Event announcing a transition into this status from `from`.
    #[must_use]
    pub const fn transition_event(from: Self, to: Self) -> Option<EventType> {
        match (from, to) {
            (Self::Created, Self::Confirmed) => Some(EventType::OrderCreated),
            (Self::Created | Self::Confirmed, Self::Failed) => Some(EventType::OrderFailed),
            (Self::Confirmed, Self::Shipped) => Some(EventType::OrderShipped),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a fraud assessment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudStatus {
    /// Risk below threshold
    Approved,
    /// Risk at or above threshold; held for manual review
    HighRiskPendingReview,
}

impl FraudStatus {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::HighRiskPendingReview => "high_risk_pending_review",
        }
    }
}

impl fmt::Display for FraudStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order as persisted in the order store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier
    pub order_id: OrderId,
    /// Customer who placed the order
    pub customer_id: CustomerId,
    /// Line items, in request order
    pub items: Vec<LineItem>,
    /// Current status
    pub status: OrderStatus,
    /// Sum of line item totals
    pub total: Money,
    /// Payment method requested by the customer
    pub payment_method: String,
    /// Gateway reference once paid
    pub payment_id: Option<String>,
    /// Why the order failed
    pub failure_reason: Option<String>,
    /// Fraud risk score in `[0, 1]`
    pub fraud_score: Option<f64>,
    /// Fraud assessment outcome
    pub fraud_status: Option<FraudStatus>,
    /// Shipment tracking reference
    pub tracking: Option<String>,
    /// When the order was persisted
    pub created_at: DateTime<Utc>,
    /// Last mutation
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// New order in status [`OrderStatus::Created`].
    #[must_use]
    pub fn new(
        order_id: OrderId,
        customer_id: CustomerId,
        items: Vec<LineItem>,
        payment_method: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let total = items.iter().map(LineItem::total).sum();
        Self {
            order_id,
            customer_id,
            items,
            status: OrderStatus::Created,
            total,
            payment_method: payment_method.into(),
            payment_id: None,
            failure_reason: None,
            fraud_score: None,
            fraud_status: None,
            tracking: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Event of type `event_type` carrying this order's payload.
    #[must_use]
    pub fn to_event(&self, event_type: EventType, at: DateTime<Utc>) -> Event {
        let mut event = Event::new(
            event_type,
            self.order_id.as_str(),
            self.customer_id.as_str(),
            at,
        )
        .with_attribute(attributes::TOTAL_AMOUNT, self.total.cents().to_string())
            .with_attribute(attributes::ITEM_COUNT, self.items.len().to_string())
            .with_attribute(attributes::ITEMS, encode_items(&self.items))
            .with_attribute(attributes::PAYMENT_METHOD, self.payment_method.clone());

        if let Some(payment_id) = &self.payment_id {
            event = event.with_attribute(attributes::PAYMENT_ID, payment_id.clone());
        }
        if let Some(reason) = &self.failure_reason {
            event = event.with_attribute(attributes::FAILURE_REASON, reason.clone());
        }
        if let Some(score) = self.fraud_score {
            event = event.with_attribute(attributes::FRAUD_SCORE, format!("{score:.2}"));
        }
        if let Some(tracking) = &self.tracking {
            event = event.with_attribute(attributes::TRACKING, tracking.clone());
        }
        event
    }
}

impl Diff for Order {
    fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.status != other.status {
            changed.push("status");
        }
        if self.items != other.items {
            changed.push("items");
        }
        if self.total != other.total {
            changed.push("total");
        }
        if self.payment_id != other.payment_id {
            changed.push("payment_id");
        }
        if self.failure_reason != other.failure_reason {
            changed.push("failure_reason");
        }
        if self.fraud_score != other.fraud_score {
            changed.push("fraud_score");
        }
        if self.fraud_status != other.fraud_status {
            changed.push("fraud_status");
        }
        if self.tracking != other.tracking {
            changed.push("tracking");
        }
        changed
    }
}

fn default_payment_method() -> String {
    "card".to_string()
}

/// One requested line of an order submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemRequest {
    /// Catalog product
    pub product_id: String,
    /// Requested quantity; must be positive
    pub quantity: i64,
}

impl OrderItemRequest {
    /// Creates a new item request
    #[must_use]
    pub fn new(product_id: impl Into<String>, quantity: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// Order submission.
///
/// ```json
/// { "customer_id": "cust-1", "items": [{ "product_id": "prod-001", "quantity": 2 }] }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Customer placing the order
    pub customer_id: String,
    /// Requested items, in order
    pub items: Vec<OrderItemRequest>,
    /// `card` unless specified
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
}

impl CreateOrderRequest {
    /// Card-paid submission.
    #[must_use]
    pub fn new(customer_id: impl Into<String>, items: Vec<OrderItemRequest>) -> Self {
        Self {
            customer_id: customer_id.into(),
            items,
            payment_method: default_payment_method(),
        }
    }

    /// Override the payment method.
    #[must_use]
    pub fn with_payment_method(mut self, method: impl Into<String>) -> Self {
        self.payment_method = method.into();
        self
    }
}

/// Definitive answer to an order submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderResult {
    /// Persisted order
    pub order_id: OrderId,
    /// `confirmed` or `failed`
    pub status: OrderStatus,
    /// Order total in cents
    pub total_amount: Money,
    /// Gateway reference when paid
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
}

impl OrderResult {
    /// HTTP-equivalent status code: 201 when confirmed, 402 when payment failed.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self.status {
            OrderStatus::Confirmed => 201,
            OrderStatus::Failed => 402,
            OrderStatus::Created | OrderStatus::Shipped => 200,
        }
    }
}

impl From<&Order> for OrderResult {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.order_id.clone(),
            status: order.status,
            total_amount: order.total,
            payment_id: order.payment_id.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn item(id: &str, quantity: u32, cents: i64) -> LineItem {
        LineItem::new(id.to_string(), id.to_string(), quantity, Money::from_cents(cents))
    }

    #[test]
    fn allowed_transitions() {
        use OrderStatus::{Confirmed, Created, Failed, Shipped};
        assert!(Created.can_transition_to(Confirmed));
        assert!(Created.can_transition_to(Failed));
        assert!(Confirmed.can_transition_to(Shipped));
        assert!(Confirmed.can_transition_to(Failed));

        assert!(!Created.can_transition_to(Shipped));
        assert!(!Shipped.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Confirmed));
        assert!(Shipped.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn each_transition_maps_to_one_event() {
        use OrderStatus::{Confirmed, Created, Failed, Shipped};
        assert_eq!(
            OrderStatus::transition_event(Created, Confirmed),
            Some(EventType::OrderCreated)
        );
        assert_eq!(OrderStatus::transition_event(Created, Failed), Some(EventType::OrderFailed));
        assert_eq!(
            OrderStatus::transition_event(Confirmed, Shipped),
            Some(EventType::OrderShipped)
        );
        assert_eq!(OrderStatus::transition_event(Confirmed, Failed), Some(EventType::OrderFailed));
        assert_eq!(OrderStatus::transition_event(Shipped, Failed), None);
    }

    #[test]
    fn money_overflow_is_detected() {
        let big = Money::from_cents(i64::MAX / 2);
        assert_eq!(big.checked_times(2), Some(Money::from_cents(i64::MAX - 1)));
        assert_eq!(big.checked_times(3), None);
        assert_eq!(big.checked_add(big).and_then(|m| m.checked_add(big)), None);
        assert_eq!(big.times(3), Money::from_cents(i64::MAX));
    }

    #[test]
    fn order_total_sums_line_items() {
        let order = Order::new(
            OrderId::from("o-1"),
            CustomerId::from("c-1"),
            vec![item("prod-001", 2, 7999), item("prod-004", 1, 2999)],
            "card",
            Utc::now(),
        );
        assert_eq!(order.total, Money::from_cents(18_997));
        assert_eq!(order.total.to_string(), "$189.97");
    }

    #[test]
    fn items_attribute_parses_back() {
        let items = vec![item("prod-001", 2, 1), item("prod-003", 1, 1)];
        let encoded = encode_items(&items);
        assert_eq!(encoded, "prod-001:2,prod-003:1");
        assert_eq!(
            parse_items(&encoded).unwrap(),
            vec![("prod-001".to_string(), 2), ("prod-003".to_string(), 1)]
        );
        assert!(parse_items("prod-001:x").is_none());
        assert!(parse_items(":3").is_none());
    }

    #[test]
    fn diff_reports_changed_fields() {
        let before = Order::new(
            OrderId::from("o-1"),
            CustomerId::from("c-1"),
            vec![],
            "card",
            Utc::now(),
        );
        let mut after = before.clone();
        after.status = OrderStatus::Confirmed;
        after.fraud_score = Some(0.8);

        assert_eq!(before.changed_fields(&after), vec!["status", "fraud_score"]);
        assert!(before.changed_fields(&before).is_empty());
    }

    #[test]
    fn event_carries_order_payload() {
        let mut order = Order::new(
            OrderId::from("o-1"),
            CustomerId::from("c-1"),
            vec![item("prod-001", 2, 7999)],
            "crypto",
            Utc::now(),
        );
        order.payment_id = Some("pay-1".to_string());
        let event = order.to_event(EventType::OrderCreated, Utc::now());

        assert_eq!(event.order_id, "o-1");
        assert_eq!(event.attribute(attributes::TOTAL_AMOUNT), Some("15998"));
        assert_eq!(event.attribute(attributes::PAYMENT_METHOD), Some("crypto"));
        assert_eq!(event.attribute(attributes::PAYMENT_ID), Some("pay-1"));
        assert_eq!(event.attribute(attributes::FAILURE_REASON), None);
    }

    #[test]
    fn request_defaults_to_card() {
        let request: CreateOrderRequest = serde_json::from_str(
            r#"{"customer_id":"cust-1","items":[{"product_id":"prod-001","quantity":2}]}"#,
        )
        .unwrap();
        assert_eq!(request.payment_method, "card");
        assert_eq!(request.items[0].quantity, 2);
    }
}
