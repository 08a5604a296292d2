//! Order pipeline demo.
//!
//! Starts the pipeline in-process, submits a burst of concurrent orders,
//! reports latency percentiles and outcomes, waits for every consumer to
//! drain, then prints queue stats, health, and the Prometheus metrics text.

use anyhow::Context;
use futures::future::join_all;
use orderflow_pipeline::{
    CreateOrderRequest, OrderItemRequest, OrderStatus, Pipeline, PipelineConfig,
};
use orderflow_runtime::metrics::MetricsServer;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Default, Serialize)]
struct LatencySummary {
    p50_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
    max_ms: f64,
}

#[derive(Debug, Serialize)]
struct DemoSummary {
    submitted: usize,
    confirmed: usize,
    payment_failed: usize,
    errors: usize,
    shipped: usize,
    archived: usize,
    latency: LatencySummary,
    emails_sent: usize,
    fraud_assessed: usize,
    revenue: String,
    stream_notifications: usize,
    dead_letters: usize,
}

fn percentile(sorted: &[Duration], pct: usize) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = (sorted.len() * pct / 100).min(sorted.len() - 1);
    sorted[index].as_secs_f64() * 1_000.0
}

fn latency_summary(mut samples: Vec<Duration>) -> LatencySummary {
    samples.sort_unstable();
    LatencySummary {
        p50_ms: percentile(&samples, 50),
        p95_ms: percentile(&samples, 95),
        p99_ms: percentile(&samples, 99),
        max_ms: samples.last().map_or(0.0, |d| d.as_secs_f64() * 1_000.0),
    }
}

fn demo_requests(pipeline: &Pipeline, count: usize, rng: &mut StdRng) -> Vec<CreateOrderRequest> {
    let products: Vec<String> = pipeline
        .processor()
        .list_products()
        .into_iter()
        .map(|p| p.product_id)
        .collect();

    (0..count)
        .map(|i| {
            let customer = if i % 7 == 6 {
                format!("new-{i:04}")
            } else {
                format!("cust-test-{i:04}")
            };
            let lines = rng.gen_range(1..=3);
            let items = products
                .choose_multiple(rng, lines)
                .map(|product| OrderItemRequest::new(product.clone(), rng.gen_range(1..=3)))
                .collect();
            let method = if i % 5 == 4 { "crypto" } else { "card" };
            CreateOrderRequest::new(customer, items).with_payment_method(method)
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PipelineConfig::load().context("failed to load pipeline configuration")?;
    config.validate().context("invalid pipeline configuration")?;
    info!(
        orders = config.server.demo_orders,
        payment_timeout_ms = config.payment.timeout_ms,
        decline_rate = config.payment.decline_rate,
        max_delivery_count = config.queues.max_delivery_count,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr()?);
    metrics.start().context("failed to install metrics recorder")?;

    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
    let mut rng = config
        .payment
        .seed
        .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
    let pipeline = Pipeline::new(config)?;
    let running = pipeline.start();

    let requests = demo_requests(&pipeline, pipeline.config().server.demo_orders, &mut rng);
    let submitted = requests.len();
    info!(orders = submitted, "Submitting orders");

    let processor = pipeline.processor();
    let outcomes = join_all(requests.into_iter().map(|request| async move {
        let started = Instant::now();
        let result = processor.create_order(request).await;
        (started.elapsed(), result)
    }))
    .await;

    let mut latencies = Vec::with_capacity(outcomes.len());
    let (mut confirmed, mut payment_failed, mut errors) = (Vec::new(), Vec::new(), 0);
    for (elapsed, result) in outcomes {
        latencies.push(elapsed);
        match result {
            Ok(order) if order.status == OrderStatus::Confirmed => confirmed.push(order.order_id),
            Ok(order) => payment_failed.push(order.order_id),
            Err(e) => {
                warn!(error = %e, status_code = e.status_code(), "Order submission failed");
                errors += 1;
            }
        }
    }
    info!(
        confirmed = confirmed.len(),
        payment_failed = payment_failed.len(),
        errors,
        "Orders submitted"
    );

    // Let fraud checks settle before shipping.
    pipeline.drain(drain_timeout).await?;

    let mut shipped = 0;
    for (i, order_id) in confirmed.iter().enumerate().take(confirmed.len() / 2) {
        match processor.ship_order(order_id, &format!("TRACK-{:05}", i + 1)).await {
            Ok(_) => shipped += 1,
            Err(e) => warn!(order_id = %order_id, error = %e, "Could not ship order"),
        }
    }
    let mut archived = 0;
    for order_id in &payment_failed {
        match processor.archive_order(order_id) {
            Ok(_) => archived += 1,
            Err(e) => warn!(order_id = %order_id, error = %e, "Could not archive order"),
        }
    }

    if !pipeline.drain(drain_timeout).await? {
        warn!("Queues still hold messages at shutdown");
    }

    for report in pipeline.queue_reports().await? {
        println!(
            "queue {:<10} visible={} in_flight={} dead_lettered={} pending_dead_letters={}",
            report.name,
            report.stats.visible,
            report.stats.in_flight,
            report.stats.dead_lettered,
            report.pending_dead_letters
        );
    }
    let health = pipeline.health().await;
    println!("{health}");

    let summary = DemoSummary {
        submitted,
        confirmed: confirmed.len(),
        payment_failed: payment_failed.len(),
        errors,
        shipped,
        archived,
        latency: latency_summary(latencies),
        emails_sent: pipeline.email().outbox().len(),
        fraud_assessed: pipeline.fraud().assessed(),
        revenue: pipeline.analytics().totals().revenue.to_string(),
        stream_notifications: pipeline.stream_handler().notifications().len(),
        dead_letters: pipeline.dead_letters().count_pending(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let Some(text) = metrics.render() {
        println!("{text}");
    }

    running.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_pick_nearest_rank() {
        let samples: Vec<_> = (1..=100).map(Duration::from_millis).collect();
        let summary = latency_summary(samples);
        assert!((summary.p50_ms - 51.0).abs() < 1e-9);
        assert!((summary.p99_ms - 100.0).abs() < 1e-9);
        assert!((summary.max_ms - 100.0).abs() < 1e-9);
        assert!(percentile(&[], 50).abs() < f64::EPSILON);
    }
}
