//! Fan-out [`EventBus`] over a static set of subscriptions.
//!
//! `publish` evaluates every subscription's filter, enqueues a copy into each
//! matching queue concurrently, and resolves once every enqueue has completed,
//! failed, or timed out. Transient enqueue failures are retried with the
//! configured [`RetryPolicy`] inside the per-enqueue timeout.

use crate::metrics::BusMetrics;
use crate::retry::{RetryPolicy, retry_if};
use futures::future::join_all;
use orderflow_core::BoxFuture;
use orderflow_core::event::Event;
use orderflow_core::event_bus::{
    Delivery, EnqueueFailure, EventBus, PublishError, PublishResult, Subscription, Subscriptions,
};
use orderflow_core::queue::{MessageId, QueueError};
use std::time::{Duration, Instant};

/// Configuration for [`FanoutEventBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Upper bound for one subscription's enqueue, retries included.
    pub enqueue_timeout: Duration,
    /// Retry policy for transient enqueue failures.
    pub retry: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_secs(5),
            retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(20))
                .max_delay(Duration::from_millis(500))
                .build(),
        }
    }
}

/// Publishes each event to every subscription whose filter matches.
///
/// # Example
///
/// ```ignore
/// let bus = FanoutEventBus::new(subscriptions, BusConfig::default());
/// let result = bus.publish(&event).await?;
/// println!("delivered to {} queues", result.fan_out());
/// ```
#[derive(Debug, Clone)]
pub struct FanoutEventBus {
    subscriptions: Subscriptions,
    config: BusConfig,
}

impl FanoutEventBus {
    /// Create a bus over a fixed subscription set.
    #[must_use]
    pub fn new(subscriptions: Subscriptions, config: BusConfig) -> Self {
        tracing::info!(subscriptions = subscriptions.len(), "Event bus configured");
        Self {
            subscriptions,
            config,
        }
    }

    /// The subscription set.
    #[must_use]
    pub const fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    async fn deliver(
        &self,
        subscription: &Subscription,
        event: &Event,
    ) -> Result<MessageId, EnqueueFailure> {
        let enqueue = retry_if(
            &self.config.retry,
            || subscription.queue.enqueue(event.clone()),
            QueueError::is_transient,
        );

        match tokio::time::timeout(self.config.enqueue_timeout, enqueue).await {
            Ok(Ok(message_id)) => Ok(message_id),
            Ok(Err(err)) => Err(EnqueueFailure {
                consumer: subscription.consumer.clone(),
                reason: err.to_string(),
                timed_out: false,
            }),
            Err(_) => Err(EnqueueFailure {
                consumer: subscription.consumer.clone(),
                reason: format!("enqueue timed out after {:?}", self.config.enqueue_timeout),
                timed_out: true,
            }),
        }
    }
}

impl EventBus for FanoutEventBus {
    fn publish<'a>(
        &'a self,
        event: &'a Event,
    ) -> BoxFuture<'a, Result<PublishResult, PublishError>> {
        Box::pin(async move {
            let started = Instant::now();
            let (matched, skipped): (Vec<&Subscription>, Vec<&Subscription>) = self
                .subscriptions
                .iter()
                .partition(|s| s.filter.matches(event));

            let filtered_out = skipped
                .into_iter()
                .map(|s| {
                    BusMetrics::record_filtered(s.consumer.as_str());
                    s.consumer.clone()
                })
                .collect();

            let outcomes = join_all(matched.iter().map(|s| async move {
                (s.consumer.clone(), self.deliver(s, event).await)
            }))
            .await;

            let mut delivered = Vec::new();
            let mut failures = Vec::new();
            for (consumer, outcome) in outcomes {
                match outcome {
                    Ok(message_id) => {
                        BusMetrics::record_enqueue(consumer.as_str());
                        delivered.push(Delivery {
                            consumer,
                            message_id,
                        });
                    }
                    Err(failure) => failures.push(failure),
                }
            }

            let event_type = event.event_type.as_str();
            if !failures.is_empty() {
                tracing::error!(
                    order_id = %event.order_id,
                    event_type,
                    delivered = delivered.len(),
                    failed = failures.len(),
                    failures = ?failures,
                    "Publish failed for some subscriptions"
                );
                BusMetrics::record_publish_error(event_type);
                return Err(PublishError {
                    order_id: event.order_id.clone(),
                    event_type: event.event_type,
                    delivered,
                    failures,
                });
            }

            tracing::debug!(
                order_id = %event.order_id,
                event_type,
                fan_out = delivered.len(),
                "Event published"
            );
            BusMetrics::record_publish(event_type, started.elapsed());
            Ok(PublishResult {
                delivered,
                filtered_out,
            })
        })
    }
}
