//! Full pipeline runs: workers draining every queue, duplicate deliveries,
//! and the order change stream across a restart.

#![allow(clippy::unwrap_used)]

use orderflow_core::environment::{Clock, SystemClock};
use orderflow_core::event::{Event, EventType, attributes};
use orderflow_core::queue::DurableQueue;
use orderflow_pipeline::consumers::FraudRules;
use orderflow_pipeline::types::FraudStatus;
use orderflow_pipeline::{
    CreateOrderRequest, OrderId, OrderItemRequest, OrderStatus, Pipeline, PipelineConfig,
    SimulatedPaymentGateway, StreamNotification,
};
use orderflow_testing::ManualClock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    let rules = FraudRules::deterministic(0.7);
    config.fraud.threshold = rules.threshold;
    config.fraud.jitter = rules.jitter;
    config.fraud.inference_delay_ms = 0;
    config.stream.poll_interval_ms = 10;
    config
}

fn pipeline() -> Pipeline {
    Pipeline::build(
        config(),
        Arc::new(SimulatedPaymentGateway::approving(Duration::ZERO)),
        Arc::new(SystemClock),
    )
}

async fn order(
    pipeline: &Pipeline,
    customer: &str,
    (product, quantity): (&str, i64),
    method: &str,
) -> OrderId {
    let items = vec![OrderItemRequest::new(product, quantity)];
    let result = pipeline
        .processor()
        .create_order(CreateOrderRequest::new(customer, items).with_payment_method(method))
        .await
        .unwrap();
    assert_eq!(result.status, OrderStatus::Confirmed);
    result.order_id
}

#[tokio::test]
async fn workers_apply_every_side_effect() {
    let pipeline = pipeline();
    let running = pipeline.start();

    let safe = order(&pipeline, "cust-1", ("prod-001", 2), "card").await;
    // $1299.90 from a new customer paying in crypto scores 0.9.
    let risky = order(&pipeline, "new-7", ("prod-002", 10), "crypto").await;

    assert!(pipeline.drain(Duration::from_secs(10)).await.unwrap());

    assert_eq!(pipeline.catalog().stock_of("prod-001"), Some(48));
    assert_eq!(pipeline.catalog().stock_of("prod-002"), Some(20));

    let totals = pipeline.analytics().totals();
    assert_eq!(totals.orders, 2);
    assert_eq!(totals.revenue.cents(), 15_998 + 129_990);

    let processor = pipeline.processor();
    assert_eq!(
        processor.get_order(&safe).unwrap().fraud_status,
        Some(FraudStatus::Approved)
    );
    assert_eq!(
        processor.get_order(&risky).unwrap().fraud_status,
        Some(FraudStatus::HighRiskPendingReview)
    );

    // Only the approved order is announced to the customer.
    let emails = pipeline.email().outbox();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].event_type, EventType::OrderConfirmed);
    assert_eq!(emails[0].order_id, safe.as_str());

    processor.ship_order(&safe, "TRACK-00001").await.unwrap();
    assert!(pipeline.drain(Duration::from_secs(10)).await.unwrap());
    let shipped = pipeline.email().sent_for(safe.as_str());
    assert_eq!(shipped.len(), 2);
    assert!(shipped[1].body.contains("TRACK-00001"));

    let reviews: Vec<_> = pipeline
        .stream_handler()
        .notifications()
        .into_iter()
        .filter(|n| matches!(n, StreamNotification::FraudReview { .. }))
        .collect();
    assert_eq!(reviews.len(), 1);
    assert!(matches!(
        &reviews[0],
        StreamNotification::FraudReview { order_id, .. } if *order_id == risky
    ));

    assert!(pipeline.health().await.is_healthy());
    running.shutdown().await;
}

#[tokio::test]
async fn duplicate_deliveries_apply_once() {
    let pipeline = pipeline();
    let order_id = order(&pipeline, "cust-2", ("prod-006", 3), "card").await;

    // Replay the stored order as a second copy of its creation event.
    let stored = pipeline.processor().get_order(&order_id).unwrap();
    let duplicate = stored.to_event(EventType::OrderCreated, stored.updated_at);
    for name in ["inventory", "analytics", "fraud"] {
        pipeline.queue(name).unwrap().enqueue(duplicate.clone()).await.unwrap();
    }

    let (_tx, rx) = watch::channel(false);
    for worker in pipeline.workers(&rx) {
        while !worker.poll_once().await.unwrap().is_idle() {}
    }

    assert_eq!(pipeline.catalog().stock_of("prod-006"), Some(197));
    assert_eq!(pipeline.inventory().orders_applied(), 1);
    assert_eq!(pipeline.analytics().totals().orders, 1);
    assert_eq!(pipeline.fraud().assessed(), 1);
    // One approval, one confirmation email.
    let email = pipeline.queue("email").unwrap();
    assert_eq!(email.stats().await.unwrap().visible, 1);
    assert!(pipeline.dead_letters().list_pending(10).is_empty());
}

#[tokio::test]
async fn poison_message_is_dead_lettered() {
    let mut config = config();
    config.queues.max_delivery_count = 1;
    let clock = Arc::new(ManualClock::starting_at_test_epoch());
    let pipeline = Pipeline::build(
        config,
        Arc::new(SimulatedPaymentGateway::approving(Duration::ZERO)),
        clock.clone(),
    );

    let event = Event::new(EventType::OrderCreated, "o-bad", "cust-3", clock.now())
        .with_attribute(attributes::ITEMS, "prod-404:1");
    let inventory = pipeline.queue("inventory").unwrap();
    inventory.enqueue(event).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let workers = pipeline.workers(&rx);
    let worker = workers.iter().find(|w| w.name() == "inventory").unwrap();
    let outcome = worker.poll_once().await.unwrap();
    assert_eq!(outcome.failed, 1);
    assert_eq!(pipeline.dead_letters().count_pending(), 0);

    clock.advance(Duration::from_secs(31));
    assert_eq!(inventory.stats().await.unwrap().dead_lettered, 1);

    assert_eq!(pipeline.dead_letters().count_pending_for("inventory"), 1);
    assert!(pipeline.health().await.check("inventory").unwrap().status.is_degraded());
}

#[tokio::test]
async fn fraud_check_for_archived_order_is_acknowledged() {
    let mut config = config();
    config.queues.max_delivery_count = 1;
    let clock = Arc::new(ManualClock::starting_at_test_epoch());
    let pipeline = Pipeline::build(
        config,
        Arc::new(SimulatedPaymentGateway::approving(Duration::ZERO)),
        clock.clone(),
    );
    let processor = pipeline.processor();

    let order_id = order(&pipeline, "cust-5", ("prod-007", 1), "card").await;
    processor.ship_order(&order_id, "TRACK-00005").await.unwrap();
    processor.archive_order(&order_id).unwrap();

    let (_tx, rx) = watch::channel(false);
    let workers = pipeline.workers(&rx);
    let fraud = workers.iter().find(|w| w.name() == "fraud").unwrap();
    let outcome = fraud.poll_once().await.unwrap();
    assert_eq!(outcome.received, 1);
    assert_eq!(outcome.acknowledged, 1);
    assert_eq!(outcome.failed, 0);

    clock.advance(Duration::from_secs(61));
    let stats = pipeline.queue("fraud").unwrap().stats().await.unwrap();
    assert_eq!(stats.depth(), 0);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(pipeline.dead_letters().count_pending_for("fraud"), 0);
    assert!(pipeline.health().await.check("fraud").unwrap().status.is_healthy());
}

#[tokio::test]
async fn change_stream_resumes_after_restart() {
    let pipeline = pipeline();
    let processor = pipeline.processor();
    let order_id = order(&pipeline, "cust-4", ("prod-008", 1), "card").await;

    // insert + modify(confirmed)
    let (_tx, rx) = watch::channel(false);
    let first = pipeline.stream_processor(rx.clone());
    assert_eq!(first.poll_once().await.unwrap().processed, 2);
    drop(first);

    processor.cancel_order(&order_id).await.unwrap();
    processor.archive_order(&order_id).unwrap();

    let second = pipeline.stream_processor(rx);
    let progress = second.poll_once().await.unwrap();
    assert_eq!(progress.processed, 2);
    assert_eq!(progress.checkpoint, Some(4));
    assert_eq!(pipeline.stream_lag(), 0);

    let sequences: Vec<u64> = pipeline
        .stream_handler()
        .notifications()
        .iter()
        .map(StreamNotification::sequence)
        .collect();
    let mut distinct = sequences.clone();
    distinct.dedup();
    assert_eq!(distinct, vec![1, 2, 3, 4]);

    let notifications = pipeline.stream_handler().notifications();
    assert!(notifications.iter().any(|n| matches!(
        n,
        StreamNotification::StatusChanged { to: OrderStatus::Failed, .. }
    )));
    assert!(matches!(
        notifications.last(),
        Some(StreamNotification::Deleted { final_status: OrderStatus::Failed, .. })
    ));
    assert!(pipeline.stream_handler().customer_orders("cust-4").is_empty());
}
