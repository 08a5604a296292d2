//! Wiring: one bus, four consumer queues sharing a dead-letter store, their
//! workers, and the order change stream.
//!
//! | Consumer | Subscribes to |
//! |----------|---------------|
//! | inventory | `order_created` |
//! | email | `order_confirmed`, `order_shipped` |
//! | analytics | `order_created` |
//! | fraud | `order_created` |

use crate::catalog::Catalog;
use crate::config::{ConsumerSettings, PipelineConfig};
use crate::consumers::{
    AnalyticsConsumer, EmailConsumer, FraudConsumer, FraudRules, InventoryConsumer,
};
use crate::payment::{PaymentGateway, SimulatedPaymentGateway};
use crate::processor::{OrderProcessor, ProcessorConfig};
use crate::store::{CheckpointTable, OrderStore};
use crate::stream::OrderChangeHandler;
use crate::types::Order;
use orderflow_core::change_stream::ChangeHandler;
use orderflow_core::consumer::MessageHandler;
use orderflow_core::environment::{Clock, SystemClock};
use orderflow_core::event::EventType;
use orderflow_core::event_bus::Subscriptions;
use orderflow_core::filter::SubscriptionFilter;
use orderflow_core::queue::{DurableQueue, QueueError, QueueStats};
use orderflow_runtime::{
    BusConfig, ChangeStreamProcessor, ConsumerWorker, DeadLetterStore, FanoutEventBus, HealthCheck,
    HealthReport, InMemoryQueue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A consumer queue and the settings of the worker draining it.
#[derive(Debug, Clone)]
pub struct ConsumerQueue {
    /// Consumer (and queue) name
    pub name: &'static str,
    /// The queue
    pub queue: Arc<InMemoryQueue>,
    /// Worker settings
    pub settings: ConsumerSettings,
}

/// Stats of one consumer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueReport {
    /// Consumer name
    pub name: &'static str,
    /// Queue counts
    pub stats: QueueStats,
    /// Dead letters still pending for this queue
    pub pending_dead_letters: usize,
}

/// The assembled order pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    catalog: Arc<Catalog>,
    store: Arc<OrderStore>,
    processor: Arc<OrderProcessor>,
    dead_letters: Arc<DeadLetterStore>,
    queues: Vec<ConsumerQueue>,
    inventory: Arc<InventoryConsumer>,
    email: Arc<EmailConsumer>,
    analytics: Arc<AnalyticsConsumer>,
    fraud: Arc<FraudConsumer>,
    stream_handler: Arc<OrderChangeHandler>,
    checkpoints: Arc<CheckpointTable>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("queues", &self.queues)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Pipeline with a simulated payment gateway and the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::config::ConfigError) if `config` does not validate.
    pub fn new(config: PipelineConfig) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        let payment = &config.payment;
        let gateway: Arc<dyn PaymentGateway> = match payment.seed {
            Some(seed) => Arc::new(SimulatedPaymentGateway::seeded(
                payment.latency(),
                payment.decline_rate,
                seed,
            )),
            None => Arc::new(SimulatedPaymentGateway::new(payment.latency(), payment.decline_rate)),
        };
        Ok(Self::build(config, gateway, Arc::new(SystemClock)))
    }

    /// Assemble the pipeline from explicit parts. `config` is used as given.
    #[must_use]
    pub fn build(
        config: PipelineConfig,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let catalog = Arc::new(Catalog::seeded());
        let store = Arc::new(OrderStore::with_clock(clock.clone()));
        let dead_letters = Arc::new(DeadLetterStore::with_clock(clock.clone()));

        let queue = |name: &'static str, settings: ConsumerSettings| ConsumerQueue {
            name,
            queue: Arc::new(
                InMemoryQueue::with_clock(name, config.queues.queue_config(), clock.clone())
                    .with_dead_letters(dead_letters.clone()),
            ),
            settings,
        };
        let consumers = &config.consumers;
        let inventory_queue = queue("inventory", consumers.inventory);
        let email_queue = queue("email", consumers.email);
        let analytics_queue = queue("analytics", consumers.analytics);
        let fraud_queue = queue("fraud", consumers.fraud);

        let created = || SubscriptionFilter::event_types([EventType::OrderCreated]);
        let subscriptions = Subscriptions::new()
            .subscribe("inventory", created(), inventory_queue.queue.clone())
            .subscribe(
                "email",
                SubscriptionFilter::event_types([
                    EventType::OrderConfirmed,
                    EventType::OrderShipped,
                ]),
                email_queue.queue.clone(),
            )
            .subscribe("analytics", created(), analytics_queue.queue.clone())
            .subscribe("fraud", created(), fraud_queue.queue.clone());
        let bus = Arc::new(FanoutEventBus::new(subscriptions, BusConfig::default()));

        let processor = Arc::new(
            OrderProcessor::new(
                store.clone(),
                catalog.clone(),
                gateway,
                bus,
                ProcessorConfig {
                    payment_timeout: config.payment.timeout(),
                },
            )
            .with_clock(clock.clone()),
        );

        let rules = FraudRules {
            threshold: config.fraud.threshold,
            jitter: config.fraud.jitter,
            inference_delay: Duration::from_millis(config.fraud.inference_delay_ms),
        };
        let mut fraud = FraudConsumer::new(processor.clone(), rules);
        if let Some(seed) = config.payment.seed {
            fraud = fraud.with_seed(seed);
        }

        Self {
            inventory: Arc::new(InventoryConsumer::new(catalog.clone())),
            email: Arc::new(EmailConsumer::new(config.email.from.clone())),
            analytics: Arc::new(AnalyticsConsumer::new()),
            fraud: Arc::new(fraud),
            stream_handler: Arc::new(OrderChangeHandler::new(config.fraud.threshold)),
            checkpoints: Arc::new(CheckpointTable::new()),
            queues: vec![inventory_queue, email_queue, analytics_queue, fraud_queue],
            config,
            catalog,
            store,
            processor,
            dead_letters,
            clock,
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The order processor (order submission and lifecycle).
    #[must_use]
    pub const fn processor(&self) -> &Arc<OrderProcessor> {
        &self.processor
    }

    /// Product catalog.
    #[must_use]
    pub const fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Order store.
    #[must_use]
    pub const fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    /// Dead letters of every queue.
    #[must_use]
    pub const fn dead_letters(&self) -> &Arc<DeadLetterStore> {
        &self.dead_letters
    }

    /// Consumer queues, in subscription order.
    #[must_use]
    pub fn queues(&self) -> &[ConsumerQueue] {
        &self.queues
    }

    /// Queue of the named consumer.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<&Arc<InMemoryQueue>> {
        self.queues.iter().find(|q| q.name == name).map(|q| &q.queue)
    }

    /// Inventory consumer.
    #[must_use]
    pub const fn inventory(&self) -> &Arc<InventoryConsumer> {
        &self.inventory
    }

    /// Email consumer.
    #[must_use]
    pub const fn email(&self) -> &Arc<EmailConsumer> {
        &self.email
    }

    /// Analytics consumer.
    #[must_use]
    pub const fn analytics(&self) -> &Arc<AnalyticsConsumer> {
        &self.analytics
    }

    /// Fraud consumer.
    #[must_use]
    pub const fn fraud(&self) -> &Arc<FraudConsumer> {
        &self.fraud
    }

    /// Change stream handler.
    #[must_use]
    pub const fn stream_handler(&self) -> &Arc<OrderChangeHandler> {
        &self.stream_handler
    }

    /// Change stream checkpoints.
    #[must_use]
    pub const fn checkpoints(&self) -> &Arc<CheckpointTable> {
        &self.checkpoints
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn MessageHandler>> {
        let handler: Arc<dyn MessageHandler> = match name {
            "inventory" => self.inventory.clone(),
            "email" => self.email.clone(),
            "analytics" => self.analytics.clone(),
            "fraud" => self.fraud.clone(),
            _ => return None,
        };
        Some(handler)
    }

    /// Workers for every consumer queue, all stopped by `shutdown`.
    #[must_use]
    pub fn workers(&self, shutdown: &watch::Receiver<bool>) -> Vec<ConsumerWorker> {
        self.queues
            .iter()
            .filter_map(|q| {
                let handler = self.handler(q.name)?;
                Some(ConsumerWorker::with_shutdown(
                    q.queue.clone(),
                    handler,
                    q.settings.worker_config(),
                    shutdown.clone(),
                ))
            })
            .collect()
    }

    /// Change stream processor over the order store, stopped by `shutdown`.
    #[must_use]
    pub fn stream_processor(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> ChangeStreamProcessor<Order> {
        let handler: Arc<dyn ChangeHandler<Order>> = self.stream_handler.clone();
        ChangeStreamProcessor::with_shutdown(
            self.store.clone(),
            handler,
            self.checkpoints.clone(),
            self.config.stream.stream_config(),
            shutdown,
        )
        .with_clock(self.clock.clone())
    }

    /// Spawn every worker and the change stream processor.
    #[must_use]
    pub fn start(&self) -> RunningPipeline {
        let (shutdown, receiver) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = self
            .workers(&receiver)
            .into_iter()
            .map(|worker| tokio::spawn(worker.run()))
            .collect();
        tasks.push(tokio::spawn(self.stream_processor(receiver).run()));
        tracing::info!(workers = tasks.len() - 1, "Pipeline started");
        RunningPipeline { shutdown, tasks }
    }

    /// Counts of every consumer queue.
    ///
    /// # Errors
    ///
    /// Returns the first [`QueueError`] from a stats call.
    pub async fn queue_reports(&self) -> Result<Vec<QueueReport>, QueueError> {
        let mut reports = Vec::with_capacity(self.queues.len());
        for q in &self.queues {
            reports.push(QueueReport {
                name: q.name,
                stats: q.queue.stats().await?,
                pending_dead_letters: self.dead_letters.count_pending_for(q.name),
            });
        }
        Ok(reports)
    }

    /// Change records not yet handled by the stream processor.
    #[must_use]
    pub fn stream_lag(&self) -> u64 {
        let last = self.store.last_sequence().unwrap_or(0);
        let handled = self.checkpoints.sequence_of(self.stream_handler.name()).unwrap_or(0);
        last.saturating_sub(handled)
    }

    /// Whether every queue is empty and the change stream has caught up.
    ///
    /// # Errors
    ///
    /// Returns the first [`QueueError`] from a stats call.
    pub async fn is_drained(&self) -> Result<bool, QueueError> {
        let reports = self.queue_reports().await?;
        Ok(reports.iter().all(|r| r.stats.depth() == 0) && self.stream_lag() == 0)
    }

    /// Wait until [`Pipeline::is_drained`] holds or `timeout` passes.
    ///
    /// Returns whether the pipeline drained.
    ///
    /// # Errors
    ///
    /// Returns the first [`QueueError`] from a stats call.
    pub async fn drain(&self, timeout: Duration) -> Result<bool, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_drained().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(timeout_ms = timeout.as_millis(), "Pipeline did not drain in time");
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Health of every queue and the change stream.
    ///
    /// A queue is degraded while it has pending dead letters and unhealthy
    /// once its depth exceeds the configured alert level.
    pub async fn health(&self) -> HealthReport {
        let alert = self.config.queues.depth_alert;
        let mut checks = Vec::with_capacity(self.queues.len() + 1);

        for q in &self.queues {
            let pending = self.dead_letters.count_pending_for(q.name);
            let check = match q.queue.stats().await {
                Err(e) => HealthCheck::unhealthy(q.name, e.to_string()),
                Ok(stats) if stats.depth() > alert => {
                    HealthCheck::unhealthy(q.name, format!("depth {} above {alert}", stats.depth()))
                        .with_metadata("depth", stats.depth())
                }
                Ok(stats) if pending > 0 => {
                    HealthCheck::degraded(q.name, format!("{pending} pending dead letters"))
                        .with_metadata("depth", stats.depth())
                }
                Ok(stats) => HealthCheck::healthy(q.name).with_metadata("depth", stats.depth()),
            };
            checks.push(check.with_metadata("dead_letters", pending));
        }

        let lag = self.stream_lag();
        let stream = if usize::try_from(lag).ok().is_none_or(|lag| lag > alert) {
            HealthCheck::degraded(self.stream_handler.name(), format!("{lag} records behind"))
        } else {
            HealthCheck::healthy(self.stream_handler.name())
        };
        checks.push(stream.with_metadata("lag", lag));

        HealthReport::with_clock(checks, self.clock.as_ref())
    }
}

/// Spawned workers and stream processor.
#[derive(Debug)]
pub struct RunningPipeline {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningPipeline {
    /// Signal every task to stop and wait for them. Workers finish their
    /// current batch first.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("Every pipeline task already stopped");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Pipeline task panicked");
            }
        }
        tracing::info!("Pipeline stopped");
    }
}
