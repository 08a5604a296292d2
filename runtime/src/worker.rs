//! Consumer worker: drains one durable queue into one message handler.
//!
//! # Loop
//!
//! 1. Dequeue up to `batch_size` messages with the configured visibility timeout
//! 2. Run the handler on each message concurrently, bounded by `processing_timeout`
//! 3. Acknowledge every message whose handler returned `Ok`
//! 4. Leave failures unacknowledged; the queue redelivers them after the timeout
//! 5. On an empty poll, back off exponentially (reset when work shows up)
//!
//! While a slow handler runs, an optional heartbeat keeps pushing the
//! message's visibility deadline forward so it is not redelivered mid-flight.
//!
//! The worker stops between polls once its shutdown channel turns `true`;
//! a batch already dequeued is finished first.

use crate::metrics::ConsumerMetrics;
use crate::retry::{IdleBackoff, RetryPolicy};
use futures::future::join_all;
use orderflow_core::consumer::{MessageHandler, ProcessingError};
use orderflow_core::queue::{DurableQueue, QueueError, QueueMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Configuration for a [`ConsumerWorker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Messages per dequeue.
    pub batch_size: usize,
    /// Visibility timeout requested on dequeue (and on each heartbeat).
    pub visibility_timeout: Duration,
    /// Budget for one handler call.
    pub processing_timeout: Duration,
    /// Interval between visibility extensions while a handler runs. `None` disables it.
    pub heartbeat: Option<Duration>,
    /// Backoff between empty polls.
    pub idle_backoff: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            visibility_timeout: Duration::from_secs(30),
            processing_timeout: Duration::from_secs(25),
            heartbeat: None,
            idle_backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(50))
                .max_delay(Duration::from_secs(2))
                .build(),
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Messages dequeued.
    pub received: usize,
    /// Messages processed and acknowledged.
    pub acknowledged: usize,
    /// Messages whose handler failed or timed out.
    pub failed: usize,
    /// Messages processed but no longer owned when acknowledging (lock expired).
    pub lost: usize,
}

impl PollOutcome {
    /// Whether the poll found no work.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.received == 0
    }
}

enum MessageOutcome {
    Acknowledged,
    Failed,
    Lost,
}

/// Polls a queue and dispatches messages to a handler.
///
/// # Example
///
/// ```ignore
/// let (worker, shutdown) = ConsumerWorker::new(queue, Arc::new(EmailConsumer::new(..)), WorkerConfig::default());
/// let handle = tokio::spawn(worker.run());
///
/// // later
/// shutdown.send(true).ok();
/// handle.await?;
/// ```
pub struct ConsumerWorker {
    queue: Arc<dyn DurableQueue>,
    handler: Arc<dyn MessageHandler>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl ConsumerWorker {
    /// Create a worker and the sender that stops it.
    ///
    /// Send `true` to stop the worker after its current batch.
    #[must_use]
    pub fn new(
        queue: Arc<dyn DurableQueue>,
        handler: Arc<dyn MessageHandler>,
        config: WorkerConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Self::with_shutdown(queue, handler, config, shutdown_rx);
        (worker, shutdown_tx)
    }

    /// Create a worker listening on an existing shutdown channel.
    ///
    /// Lets one sender stop every worker of a pipeline.
    #[must_use]
    pub fn with_shutdown(
        queue: Arc<dyn DurableQueue>,
        handler: Arc<dyn MessageHandler>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            shutdown,
        }
    }

    /// Name of the handler this worker runs.
    #[must_use]
    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Dequeue one batch and process it.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the dequeue itself fails. Handler and
    /// acknowledgment failures are reported in the [`PollOutcome`].
    pub async fn poll_once(&self) -> Result<PollOutcome, QueueError> {
        let batch = self
            .queue
            .dequeue(self.config.batch_size, self.config.visibility_timeout)
            .await?;

        let mut outcome = PollOutcome {
            received: batch.len(),
            ..PollOutcome::default()
        };
        if batch.is_empty() {
            return Ok(outcome);
        }

        tracing::debug!(
            consumer = self.name(),
            queue = self.queue.name(),
            batch = batch.len(),
            "Processing batch"
        );

        for result in join_all(batch.iter().map(|m| self.process(m))).await {
            match result {
                MessageOutcome::Acknowledged => outcome.acknowledged += 1,
                MessageOutcome::Failed => outcome.failed += 1,
                MessageOutcome::Lost => outcome.lost += 1,
            }
        }
        Ok(outcome)
    }

    /// Poll until shutdown.
    pub async fn run(mut self) {
        let name = self.name().to_string();
        tracing::info!(
            consumer = %name,
            queue = self.queue.name(),
            batch_size = self.config.batch_size,
            visibility_timeout_ms = self.config.visibility_timeout.as_millis(),
            "Consumer worker started"
        );

        let mut backoff = IdleBackoff::new(self.config.idle_backoff.clone());

        while !*self.shutdown.borrow() {
            let delay = match self.poll_once().await {
                Ok(outcome) if outcome.is_idle() => backoff.next_delay(),
                Ok(_) => {
                    backoff.reset();
                    continue;
                }
                Err(e) => {
                    tracing::error!(consumer = %name, error = %e, "Dequeue failed");
                    backoff.next_delay()
                }
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(consumer = %name, "Consumer worker stopped");
    }

    async fn process(&self, message: &QueueMessage) -> MessageOutcome {
        let started = Instant::now();
        let result = self.handle_with_heartbeat(message).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => match self.queue.acknowledge(message.receipt()).await {
                Ok(()) => {
                    ConsumerMetrics::record_outcome(self.name(), "ok", elapsed);
                    MessageOutcome::Acknowledged
                }
                Err(e) => {
                    tracing::warn!(
                        consumer = self.name(),
                        message_id = %message.id,
                        attempt = message.delivery_count,
                        error = %e,
                        "Processed message could not be acknowledged"
                    );
                    ConsumerMetrics::record_outcome(self.name(), "lost", elapsed);
                    MessageOutcome::Lost
                }
            },
            Err(e) => {
                let outcome = if matches!(e, ProcessingError::Timeout(_)) {
                    "timeout"
                } else {
                    "error"
                };
                tracing::warn!(
                    consumer = self.name(),
                    message_id = %message.id,
                    order_id = %message.event.order_id,
                    event_type = %message.event.event_type,
                    attempt = message.delivery_count,
                    error = %e,
                    "Message processing failed, leaving for redelivery"
                );
                ConsumerMetrics::record_outcome(self.name(), outcome, elapsed);
                MessageOutcome::Failed
            }
        }
    }

    async fn handle_with_heartbeat(&self, message: &QueueMessage) -> Result<(), ProcessingError> {
        let budget = self.config.processing_timeout;
        let work = tokio::time::timeout(budget, self.handler.handle(message));
        tokio::pin!(work);

        let Some(every) = self.config.heartbeat else {
            return work.await.unwrap_or(Err(ProcessingError::Timeout(budget)));
        };

        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                result = &mut work => {
                    return result.unwrap_or(Err(ProcessingError::Timeout(budget)));
                }
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .queue
                        .extend_visibility(message.receipt(), self.config.visibility_timeout)
                        .await
                    {
                        tracing::warn!(
                            consumer = self.name(),
                            message_id = %message.id,
                            error = %e,
                            "Visibility heartbeat failed"
                        );
                    }
                }
            }
        }
    }
}
