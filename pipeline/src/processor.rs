//! Order processor: the only writer of orders.
//!
//! # Flow of `create_order`
//!
//! 1. Validate the submission and price it from the catalog
//! 2. Persist the order as `created`
//! 3. Charge the payment gateway under a deadline
//! 4. Transition to `confirmed` or `failed`
//! 5. Publish the event for that transition
//!
//! Persistence and publish are not atomic. A publish failure is reported as
//! [`OrderError::Publish`] with the persisted status and logged at error
//! level so the order can be reconciled.

use crate::catalog::{Catalog, Product};
use crate::error::{OrderError, Result};
use crate::payment::{PaymentGateway, PaymentRequest};
use crate::store::OrderStore;
use crate::types::{
    CreateOrderRequest, CustomerId, FraudStatus, LineItem, Money, Order, OrderId, OrderResult,
    OrderStatus,
};
use orderflow_core::environment::{Clock, SystemClock};
use orderflow_core::event::EventType;
use orderflow_core::event_bus::{EventBus, PublishResult};
use orderflow_runtime::metrics::OrderMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Failure reason stored on orders whose payment timed out.
pub const PAYMENT_TIMEOUT_REASON: &str = "payment_timeout";

/// Failure reason stored on cancelled orders.
pub const CANCELLED_REASON: &str = "cancelled";

/// Processor settings.
#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// Default deadline for the payment call.
    pub payment_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            payment_timeout: Duration::from_secs(5),
        }
    }
}

/// Accepts orders, drives their status, and publishes one event per transition.
pub struct OrderProcessor {
    store: Arc<OrderStore>,
    catalog: Arc<Catalog>,
    gateway: Arc<dyn PaymentGateway>,
    bus: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
}

impl OrderProcessor {
    /// Create a processor using the system clock.
    #[must_use]
    pub fn new(
        store: Arc<OrderStore>,
        catalog: Arc<Catalog>,
        gateway: Arc<dyn PaymentGateway>,
        bus: Arc<dyn EventBus>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            gateway,
            bus,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Stamp orders and events from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The order store this processor writes to.
    #[must_use]
    pub const fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    /// Create an order with the default payment deadline.
    ///
    /// # Errors
    ///
    /// See [`OrderProcessor::create_order_with_timeout`].
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<OrderResult> {
        self.create_order_with_timeout(request, self.config.payment_timeout)
            .await
    }

    /// Create an order, bounding the payment call by `payment_timeout`.
    ///
    /// A declined payment is not an error: the order ends `failed`,
    /// `order_failed` is published and the result carries status `failed`.
    ///
    /// # Errors
    ///
    /// - [`OrderError::Validation`] for an empty customer id, no items or a non-positive quantity
    /// - [`OrderError::ProductNotFound`] for an unknown product
    /// - [`OrderError::Timeout`] when the payment deadline expired (order marked failed, event published)
    /// - [`OrderError::Publish`] when the order was persisted but its event was not fully enqueued
    pub async fn create_order_with_timeout(
        &self,
        request: CreateOrderRequest,
        payment_timeout: Duration,
    ) -> Result<OrderResult> {
        let items = match self.price_items(&request) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(customer_id = %request.customer_id, error = %e, "Order rejected");
                OrderMetrics::record_order("rejected");
                return Err(e);
            }
        };

        let order = Order::new(
            OrderId::generate(),
            CustomerId::new(request.customer_id.trim().to_string()),
            items,
            request.payment_method,
            self.clock.now(),
        );
        let order_id = order.order_id.clone();
        let payment = PaymentRequest {
            order_id: order_id.clone(),
            customer_id: order.customer_id.clone(),
            amount: order.total,
            method: order.payment_method.clone(),
        };
        self.store.insert(order)?;
        tracing::info!(
            order_id = %order_id,
            customer_id = %payment.customer_id,
            total = %payment.amount,
            "Order persisted, charging payment"
        );

        let started = Instant::now();
        let charged = tokio::time::timeout(payment_timeout, self.gateway.charge(&payment)).await;
        OrderMetrics::record_payment(started.elapsed());

        match charged {
            Ok(Ok(receipt)) => {
                let order = self
                    .transition(&order_id, OrderStatus::Confirmed, |o| {
                        o.payment_id = Some(receipt.payment_id);
                    })
                    .await?;
                tracing::info!(
                    order_id = %order_id,
                    payment_id = ?order.payment_id,
                    "Order confirmed"
                );
                OrderMetrics::record_order("confirmed");
                Ok(OrderResult::from(&order))
            }
            Ok(Err(e)) => {
                let reason = e.reason();
                let order = self
                    .transition(&order_id, OrderStatus::Failed, |o| {
                        o.failure_reason = Some(reason.to_string());
                    })
                    .await?;
                tracing::info!(order_id = %order_id, error = %e, "Order failed, payment not taken");
                OrderMetrics::record_order("declined");
                Ok(OrderResult::from(&order))
            }
            Err(_elapsed) => {
                tracing::warn!(
                    order_id = %order_id,
                    timeout_ms = payment_timeout.as_millis(),
                    "Payment timed out, failing order"
                );
                OrderMetrics::record_order("timeout");
                self.transition(&order_id, OrderStatus::Failed, |o| {
                    o.failure_reason = Some(PAYMENT_TIMEOUT_REASON.to_string());
                })
                .await?;
                Err(OrderError::Timeout {
                    order_id,
                    timeout: payment_timeout,
                })
            }
        }
    }

    /// Ship a confirmed order.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`], [`OrderError::InvalidTransition`] unless
    /// confirmed, [`OrderError::Validation`] for an empty tracking reference,
    /// or [`OrderError::Publish`].
    pub async fn ship_order(&self, order_id: &OrderId, tracking: &str) -> Result<Order> {
        if tracking.trim().is_empty() {
            return Err(OrderError::Validation(
                "Tracking number cannot be empty".to_string(),
            ));
        }
        let order = self
            .transition(order_id, OrderStatus::Shipped, |o| {
                o.tracking = Some(tracking.trim().to_string());
            })
            .await?;
        tracing::info!(order_id = %order_id, tracking, "Order shipped");
        Ok(order)
    }

    /// Cancel a confirmed order.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`], [`OrderError::InvalidTransition`] unless
    /// confirmed, or [`OrderError::Publish`].
    pub async fn cancel_order(&self, order_id: &OrderId) -> Result<Order> {
        let current = self.get_order(order_id)?;
        if current.status != OrderStatus::Confirmed {
            return Err(OrderError::InvalidTransition {
                order_id: order_id.clone(),
                from: current.status,
                to: OrderStatus::Failed,
            });
        }
        let order = self
            .transition(order_id, OrderStatus::Failed, |o| {
                o.failure_reason = Some(CANCELLED_REASON.to_string());
            })
            .await?;
        tracing::info!(order_id = %order_id, "Order cancelled");
        Ok(order)
    }

    /// Store a fraud assessment on the order.
    ///
    /// An approved, confirmed order is announced with `order_confirmed`. The
    /// score is written once; repeating the call for an assessed order only
    /// republishes, so a caller may retry after a publish failure. Shipped
    /// and failed orders are immutable and are returned unchanged.
    ///
    /// # Errors
    ///
    /// [`OrderError::Validation`] for a score outside `[0, 1]`,
    /// [`OrderError::OrderNotFound`], or [`OrderError::Publish`].
    pub async fn record_fraud_assessment(
        &self,
        order_id: &OrderId,
        score: f64,
        status: FraudStatus,
    ) -> Result<Order> {
        if !(0.0..=1.0).contains(&score) {
            return Err(OrderError::Validation(format!(
                "fraud score {score} outside [0, 1]"
            )));
        }

        let current = self.get_order(order_id)?;
        if current.status.is_terminal() {
            tracing::debug!(
                order_id = %order_id,
                status = %current.status,
                "Order already final, fraud assessment dropped"
            );
            return Ok(current);
        }
        let order = if current.fraud_status.is_some() {
            tracing::debug!(order_id = %order_id, "Fraud assessment already stored");
            current
        } else {
            self.store.update(order_id, |o| {
                if o.status.is_terminal() {
                    return Err(OrderError::InvalidTransition {
                        order_id: order_id.clone(),
                        from: o.status,
                        to: o.status,
                    });
                }
                o.fraud_score = Some(score);
                o.fraud_status = Some(status);
                Ok(())
            })?
        };

        if order.fraud_status == Some(FraudStatus::Approved)
            && order.status == OrderStatus::Confirmed
        {
            self.publish(&order, EventType::OrderConfirmed).await?;
        }
        Ok(order)
    }

    /// Delete a terminal order from the store.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`], or [`OrderError::Validation`] if the
    /// order is not shipped or failed.
    pub fn archive_order(&self, order_id: &OrderId) -> Result<Order> {
        let current = self.get_order(order_id)?;
        if !current.status.is_terminal() {
            return Err(OrderError::Validation(format!(
                "order {order_id} in status '{}' cannot be archived",
                current.status
            )));
        }
        let order = self.store.remove(order_id)?;
        tracing::info!(order_id = %order_id, status = %order.status, "Order archived");
        Ok(order)
    }

    /// Look up an order.
    ///
    /// # Errors
    ///
    /// [`OrderError::OrderNotFound`] for an unknown id.
    pub fn get_order(&self, order_id: &OrderId) -> Result<Order> {
        self.store
            .get(order_id)
            .ok_or_else(|| OrderError::OrderNotFound(order_id.clone()))
    }

    /// A customer's most recent orders, newest first.
    ///
    /// # Errors
    ///
    /// [`OrderError::Validation`] for an empty customer id.
    pub fn list_orders(&self, customer_id: &str) -> Result<Vec<Order>> {
        if customer_id.trim().is_empty() {
            return Err(OrderError::Validation("customer_id required".to_string()));
        }
        Ok(self
            .store
            .list_for_customer(&CustomerId::new(customer_id.trim().to_string())))
    }

    /// Look up a product.
    ///
    /// # Errors
    ///
    /// [`OrderError::ProductNotFound`] for an unknown id.
    pub fn get_product(&self, product_id: &str) -> Result<Product> {
        self.catalog
            .get_product(product_id)
            .ok_or_else(|| OrderError::ProductNotFound(product_id.to_string()))
    }

    /// Catalog listing.
    #[must_use]
    pub fn list_products(&self) -> Vec<Product> {
        self.catalog.list_products()
    }

    fn price_items(&self, request: &CreateOrderRequest) -> Result<Vec<LineItem>> {
        if request.customer_id.trim().is_empty() {
            return Err(OrderError::Validation("customer_id is required".to_string()));
        }
        if request.items.is_empty() {
            return Err(OrderError::Validation(
                "Order must contain at least one item".to_string(),
            ));
        }

        let items = request
            .items
            .iter()
            .map(|item| {
                let quantity = u32::try_from(item.quantity)
                    .ok()
                    .filter(|&q| q > 0)
                    .ok_or_else(|| {
                        OrderError::Validation(format!(
                            "Item '{}' has invalid quantity {}",
                            item.product_id, item.quantity
                        ))
                    })?;
                let product = self.get_product(&item.product_id)?;
                Ok(LineItem::new(product.product_id, product.name, quantity, product.price))
            })
            .collect::<Result<Vec<_>>>()?;

        items
            .iter()
            .try_fold(Money::ZERO, |total, item| {
                item.unit_price
                    .checked_times(item.quantity)
                    .and_then(|line| total.checked_add(line))
            })
            .ok_or_else(|| OrderError::Validation("Order total is too large".to_string()))?;
        Ok(items)
    }

    /// Move the order to `to` and publish the one event that transition maps to.
    async fn transition<F>(&self, order_id: &OrderId, to: OrderStatus, apply: F) -> Result<Order>
    where
        F: FnOnce(&mut Order),
    {
        let mut event_type = None;
        let order = self.store.update(order_id, |order| {
            let Some(event) = OrderStatus::transition_event(order.status, to) else {
                return Err(OrderError::InvalidTransition {
                    order_id: order_id.clone(),
                    from: order.status,
                    to,
                });
            };
            event_type = Some(event);
            order.status = to;
            apply(order);
            Ok(())
        })?;
        if let Some(event_type) = event_type {
            self.publish(&order, event_type).await?;
        }
        Ok(order)
    }

    async fn publish(&self, order: &Order, event_type: EventType) -> Result<PublishResult> {
        let event = order.to_event(event_type, self.clock.now());
        self.bus.publish(&event).await.map_err(|source| {
            tracing::error!(
                order_id = %order.order_id,
                status = %order.status,
                event_type = %event_type,
                failed = source.failures.len(),
                delivered = source.delivered.len(),
                "Order persisted but event not fully published; needs reconciliation"
            );
            OrderError::Publish {
                order_id: order.order_id.clone(),
                status: order.status,
                source,
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::payment::SimulatedPaymentGateway;
    use crate::types::OrderItemRequest;
    use orderflow_core::event_bus::Subscriptions;
    use orderflow_core::filter::SubscriptionFilter;
    use orderflow_core::queue::DurableQueue;
    use orderflow_runtime::{BusConfig, FanoutEventBus, InMemoryQueue, QueueConfig};

    struct Fixture {
        processor: OrderProcessor,
        all: Arc<InMemoryQueue>,
    }

    fn fixture(latency: Duration, decline_rate: f64) -> Fixture {
        let all = Arc::new(InMemoryQueue::new("all", QueueConfig::default()));
        let bus = FanoutEventBus::new(
            Subscriptions::new().subscribe("all", SubscriptionFilter::accept_all(), all.clone()),
            BusConfig::default(),
        );
        let processor = OrderProcessor::new(
            Arc::new(OrderStore::new()),
            Arc::new(Catalog::seeded()),
            Arc::new(SimulatedPaymentGateway::seeded(latency, decline_rate, 1)),
            Arc::new(bus),
            ProcessorConfig::default(),
        );
        Fixture { processor, all }
    }

    fn request(items: Vec<OrderItemRequest>) -> CreateOrderRequest {
        CreateOrderRequest::new("cust-1", items)
    }

    async fn published(queue: &InMemoryQueue) -> Vec<EventType> {
        queue
            .dequeue(usize::MAX, Duration::from_secs(30))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.event.event_type)
            .collect()
    }

    #[tokio::test]
    async fn rejects_invalid_submissions() {
        let f = fixture(Duration::ZERO, 0.0);

        let cases = [
            CreateOrderRequest::new("", vec![OrderItemRequest::new("prod-001", 1)]),
            request(vec![]),
            request(vec![OrderItemRequest::new("prod-001", 0)]),
            request(vec![OrderItemRequest::new("prod-001", -3)]),
        ];
        for case in cases {
            let err = f.processor.create_order(case).await.unwrap_err();
            assert_eq!(err.status_code(), 400, "{err}");
        }

        let err = f
            .processor
            .create_order(request(vec![OrderItemRequest::new("prod-999", 1)]))
            .await
            .unwrap_err();
        assert_eq!(err, OrderError::ProductNotFound("prod-999".to_string()));

        assert!(f.processor.store().is_empty());
        assert!(published(&f.all).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn declined_payment_fails_order_and_publishes() {
        let f = fixture(Duration::from_millis(100), 1.0);
        let result = f
            .processor
            .create_order(request(vec![OrderItemRequest::new("prod-002", 1)]))
            .await
            .unwrap();

        assert_eq!(result.status, OrderStatus::Failed);
        assert_eq!(result.status_code(), 402);
        let order = f.processor.get_order(&result.order_id).unwrap();
        assert_eq!(order.failure_reason.as_deref(), Some("payment_declined"));
        assert_eq!(published(&f.all).await, vec![EventType::OrderFailed]);
    }

    #[tokio::test(start_paused = true)]
    async fn ship_and_cancel_follow_transitions() {
        let f = fixture(Duration::from_millis(10), 0.0);
        let first = f
            .processor
            .create_order(request(vec![OrderItemRequest::new("prod-001", 1)]))
            .await
            .unwrap();
        let second = f
            .processor
            .create_order(request(vec![OrderItemRequest::new("prod-003", 1)]))
            .await
            .unwrap();

        let shipped = f.processor.ship_order(&first.order_id, "TRACK-12345").await.unwrap();
        assert_eq!(shipped.status, OrderStatus::Shipped);
        let cancelled = f.processor.cancel_order(&second.order_id).await.unwrap();
        assert_eq!(cancelled.failure_reason.as_deref(), Some(CANCELLED_REASON));

        let err = f.processor.cancel_order(&first.order_id).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        let err = f.processor.ship_order(&second.order_id, "T-1").await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { from: OrderStatus::Failed, .. }));

        assert_eq!(
            published(&f.all).await,
            vec![
                EventType::OrderCreated,
                EventType::OrderCreated,
                EventType::OrderShipped,
                EventType::OrderFailed,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn approved_assessment_publishes_order_confirmed() {
        let f = fixture(Duration::ZERO, 0.0);
        let result = f
            .processor
            .create_order(request(vec![OrderItemRequest::new("prod-001", 1)]))
            .await
            .unwrap();
        published(&f.all).await;

        let order = f
            .processor
            .record_fraud_assessment(&result.order_id, 0.1, FraudStatus::Approved)
            .await
            .unwrap();
        assert_eq!(order.fraud_score, Some(0.1));
        assert_eq!(published(&f.all).await, vec![EventType::OrderConfirmed]);

        // A second assessment does not overwrite the first.
        let order = f
            .processor
            .record_fraud_assessment(&result.order_id, 0.9, FraudStatus::HighRiskPendingReview)
            .await
            .unwrap();
        assert_eq!(order.fraud_status, Some(FraudStatus::Approved));
    }

    #[tokio::test(start_paused = true)]
    async fn high_risk_assessment_publishes_nothing() {
        let f = fixture(Duration::ZERO, 0.0);
        let result = f
            .processor
            .create_order(request(vec![OrderItemRequest::new("prod-001", 1)]))
            .await
            .unwrap();
        published(&f.all).await;

        f.processor
            .record_fraud_assessment(&result.order_id, 0.8, FraudStatus::HighRiskPendingReview)
            .await
            .unwrap();
        assert!(published(&f.all).await.is_empty());
        assert!(f
            .processor
            .record_fraud_assessment(&result.order_id, 1.5, FraudStatus::Approved)
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn assessment_leaves_final_orders_untouched() {
        let f = fixture(Duration::ZERO, 0.0);
        let result = f
            .processor
            .create_order(request(vec![OrderItemRequest::new("prod-005", 1)]))
            .await
            .unwrap();
        f.processor.cancel_order(&result.order_id).await.unwrap();
        published(&f.all).await;
        let feed_before = f.processor.store().last_sequence();

        let order = f
            .processor
            .record_fraud_assessment(&result.order_id, 0.1, FraudStatus::Approved)
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Failed);
        assert_eq!(order.fraud_score, None);
        assert_eq!(f.processor.get_order(&result.order_id).unwrap().fraud_status, None);
        assert_eq!(f.processor.store().last_sequence(), feed_before);
        assert!(published(&f.all).await.is_empty());
    }

    #[tokio::test]
    async fn rejects_totals_that_overflow() {
        let catalog = Catalog::new();
        catalog.insert(Product::new(
            "prod-gold",
            "Gold Bar",
            Money::from_cents(i64::MAX / 4),
            10,
            "Luxury",
        ));
        let processor = OrderProcessor::new(
            Arc::new(OrderStore::new()),
            Arc::new(catalog),
            Arc::new(SimulatedPaymentGateway::approving(Duration::ZERO)),
            Arc::new(FanoutEventBus::new(Subscriptions::new(), BusConfig::default())),
            ProcessorConfig::default(),
        );

        let err = processor
            .create_order(request(vec![OrderItemRequest::new("prod-gold", 5)]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Validation(_)), "{err}");

        let err = processor
            .create_order(request(vec![
                OrderItemRequest::new("prod-gold", 3),
                OrderItemRequest::new("prod-gold", 3),
            ]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(processor.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn only_terminal_orders_are_archived() {
        let f = fixture(Duration::ZERO, 0.0);
        let result = f
            .processor
            .create_order(request(vec![OrderItemRequest::new("prod-001", 1)]))
            .await
            .unwrap();

        assert_eq!(f.processor.archive_order(&result.order_id).unwrap_err().status_code(), 400);
        f.processor.ship_order(&result.order_id, "T-1").await.unwrap();
        f.processor.archive_order(&result.order_id).unwrap();
        assert!(matches!(
            f.processor.get_order(&result.order_id),
            Err(OrderError::OrderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_orders_requires_customer() {
        let f = fixture(Duration::ZERO, 0.0);
        assert_eq!(f.processor.list_orders(" ").unwrap_err().status_code(), 400);
        assert!(f.processor.list_orders("cust-1").unwrap().is_empty());
        assert_eq!(f.processor.list_products().len(), 8);
        assert_eq!(f.processor.get_product("prod-404").unwrap_err().status_code(), 404);
    }
}
