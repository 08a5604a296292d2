//! `ChangeStreamProcessor`: follows a change feed and dispatches to a handler.
//!
//! # Overview
//!
//! The processor coordinates one handler over one feed:
//! - Loads its checkpoint to find where it left off
//! - Reads records after the checkpoint in batches
//! - Turns each record into a [`ChangeNotification`] and hands it to the handler
//! - Saves the checkpoint after every handled record
//! - Stops a batch at the first failure; the failed record is retried next poll
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │ Change Feed │ (order store)
//! └──────┬──────┘
//!        │ records after checkpoint
//!        ▼
//! ┌──────────────────────┐
//! │ ChangeStreamProcessor│
//! └────┬────────────┬────┘
//!      │            │
//!      ▼            ▼
//! ┌─────────┐ ┌──────────┐
//! │ Handler │ │Checkpoint│
//! └─────────┘ └──────────┘
//! ```

use crate::metrics::ChangeStreamMetrics;
use orderflow_core::change_stream::{
    ChangeCheckpoint, ChangeFeed, ChangeHandler, ChangeNotification, ChangeRecord,
    ChangeStreamError, Diff, FeedPosition, Result,
};
use orderflow_core::environment::{Clock, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Configuration for a [`ChangeStreamProcessor`].
#[derive(Debug, Clone)]
pub struct ChangeStreamConfig {
    /// Records read per poll.
    pub batch_size: usize,
    /// Wait between polls once the feed is drained.
    pub poll_interval: Duration,
}

impl Default for ChangeStreamConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamProgress {
    /// Records handled and checkpointed.
    pub processed: usize,
    /// Records at or below the checkpoint that were ignored.
    pub skipped: usize,
    /// Checkpointed sequence after the poll.
    pub checkpoint: Option<u64>,
}

/// Drives a [`ChangeHandler`] from a [`ChangeFeed`] with checkpointing.
///
/// The handler's name is the checkpoint key, so two processors running the
/// same handler name share progress.
///
/// # Example
///
/// ```ignore
/// let (processor, shutdown) = ChangeStreamProcessor::new(
///     store.clone(),          // Arc<dyn ChangeFeed<Order>>
///     Arc::new(OrderChangeHandler::new()),
///     checkpoint,
///     ChangeStreamConfig::default(),
/// );
///
/// tokio::spawn(processor.run());
/// // ...
/// shutdown.send(true).ok();
/// ```
pub struct ChangeStreamProcessor<T> {
    feed: Arc<dyn ChangeFeed<T>>,
    handler: Arc<dyn ChangeHandler<T>>,
    checkpoint: Arc<dyn ChangeCheckpoint>,
    config: ChangeStreamConfig,
    shutdown: watch::Receiver<bool>,
    clock: Arc<dyn Clock>,
}

impl<T> ChangeStreamProcessor<T>
where
    T: Diff + Clone + Send + Sync + 'static,
{
    /// Create a processor and the sender that stops it.
    #[must_use]
    pub fn new(
        feed: Arc<dyn ChangeFeed<T>>,
        handler: Arc<dyn ChangeHandler<T>>,
        checkpoint: Arc<dyn ChangeCheckpoint>,
        config: ChangeStreamConfig,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let processor = Self::with_shutdown(feed, handler, checkpoint, config, shutdown_rx);
        (processor, shutdown_tx)
    }

    /// Create a processor listening on an existing shutdown channel.
    #[must_use]
    pub fn with_shutdown(
        feed: Arc<dyn ChangeFeed<T>>,
        handler: Arc<dyn ChangeHandler<T>>,
        checkpoint: Arc<dyn ChangeCheckpoint>,
        config: ChangeStreamConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            feed,
            handler,
            checkpoint,
            config,
            shutdown,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp checkpoint resets from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Processor name (the handler's name).
    #[must_use]
    pub fn name(&self) -> &str {
        self.handler.name()
    }

    /// Dispatch one record to the handler by operation kind.
    ///
    /// Does not touch the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::MalformedRecord`] for a record missing an
    /// image, or the handler's error.
    pub async fn process(&self, record: &ChangeRecord<T>) -> Result<()> {
        let notification = ChangeNotification::from_record(record)?;
        self.handler.handle(&notification).await
    }

    /// Handle every record after the checkpoint, one batch at a time, until
    /// the feed is drained or a record fails.
    ///
    /// # Errors
    ///
    /// Returns the first failure. Records handled before it stay checkpointed.
    pub async fn poll_once(&self) -> Result<StreamProgress> {
        let name = self.name();
        let mut last = self
            .checkpoint
            .load_position(name)
            .await?
            .map(|p| p.sequence);
        let mut progress = StreamProgress {
            checkpoint: last,
            ..StreamProgress::default()
        };

        loop {
            let records = self.feed.read_after(last, self.config.batch_size).await?;
            if records.is_empty() {
                return Ok(progress);
            }
            let full_batch = records.len() >= self.config.batch_size;

            for record in &records {
                if last.is_some_and(|seq| record.sequence <= seq) {
                    progress.skipped += 1;
                    continue;
                }

                if let Err(e) = self.process(record).await {
                    tracing::error!(
                        processor = name,
                        sequence = record.sequence,
                        kind = %record.kind,
                        error = %e,
                        "Change record failed, will retry"
                    );
                    ChangeStreamMetrics::record_error(name);
                    return Err(e);
                }

                self.checkpoint
                    .save_position(name, record.position())
                    .await?;
                last = Some(record.sequence);
                progress.processed += 1;
                progress.checkpoint = last;
                ChangeStreamMetrics::record_processed(name, record.sequence);
                tracing::debug!(
                    processor = name,
                    sequence = record.sequence,
                    kind = %record.kind,
                    "Change record processed"
                );
            }

            if !full_batch {
                return Ok(progress);
            }
        }
    }

    /// Forget the checkpoint so the next poll replays the feed from the start.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::Checkpoint`] if the save fails.
    pub async fn reset(&self) -> Result<()> {
        let name = self.name();
        self.checkpoint
            .save_position(name, FeedPosition::new(0, self.clock.now()))
            .await?;
        tracing::info!(processor = name, "Checkpoint reset, feed will be replayed");
        Ok(())
    }

    /// Poll until shutdown.
    pub async fn run(mut self) {
        let name = self.name().to_string();
        match self.checkpoint.load_position(&name).await {
            Ok(Some(position)) => tracing::info!(
                processor = %name,
                sequence = position.sequence,
                timestamp = %position.timestamp,
                "Resuming from checkpoint"
            ),
            Ok(None) => tracing::info!(processor = %name, "Starting from beginning"),
            Err(e) => tracing::warn!(processor = %name, error = %e, "Could not load checkpoint"),
        }

        while !*self.shutdown.borrow() {
            if let Err(e) = self.poll_once().await {
                if !matches!(e, ChangeStreamError::Handler { .. }) {
                    tracing::error!(processor = %name, error = %e, "Change stream poll failed");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(processor = %name, "Change stream processor stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orderflow_testing::{
        InMemoryChangeCheckpoint, InMemoryChangeFeed, ManualClock, RecordingChangeHandler,
    };

    #[derive(Clone, Debug, PartialEq)]
    struct Doc(&'static str);

    impl Diff for Doc {
        fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
            if self == other { vec![] } else { vec!["value"] }
        }
    }

    type Parts = (
        Arc<InMemoryChangeFeed<Doc>>,
        Arc<RecordingChangeHandler<Doc>>,
        Arc<InMemoryChangeCheckpoint>,
    );

    fn parts() -> Parts {
        (
            Arc::new(InMemoryChangeFeed::new()),
            Arc::new(RecordingChangeHandler::new("docs")),
            Arc::new(InMemoryChangeCheckpoint::new()),
        )
    }

    fn processor(
        (feed, handler, checkpoint): &Parts,
        batch_size: usize,
    ) -> ChangeStreamProcessor<Doc> {
        ChangeStreamProcessor::new(
            feed.clone(),
            handler.clone(),
            checkpoint.clone(),
            ChangeStreamConfig {
                batch_size,
                ..ChangeStreamConfig::default()
            },
        )
        .0
    }

    #[tokio::test]
    async fn drains_feed_across_batches() {
        let parts = parts();
        for value in ["a", "b", "c", "d", "e"] {
            parts.0.push(ChangeRecord::insert(0, Doc(value), Utc::now()));
        }

        let progress = processor(&parts, 2).poll_once().await.unwrap();

        assert_eq!(progress.processed, 5);
        assert_eq!(progress.checkpoint, Some(5));
        assert_eq!(parts.1.handled_sequences(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn stops_at_failure_and_retries_same_record() {
        let parts = parts();
        parts.0.push(ChangeRecord::insert(0, Doc("a"), Utc::now()));
        parts.0.push(ChangeRecord::modify(0, Doc("a"), Doc("b"), Utc::now()));
        parts.0.push(ChangeRecord::remove(0, Doc("b"), Utc::now()));
        parts.1.fail_on(2);

        let processor = processor(&parts, 10);
        assert!(processor.poll_once().await.is_err());
        assert_eq!(parts.2.sequence_of("docs"), Some(1));
        assert_eq!(parts.1.handled_sequences(), vec![1]);

        parts.1.recover();
        let progress = processor.poll_once().await.unwrap();
        assert_eq!(progress.processed, 2);
        assert_eq!(parts.1.handled_sequences(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reset_replays_from_start() {
        let parts = parts();
        parts.0.push(ChangeRecord::insert(0, Doc("a"), Utc::now()));
        let clock = Arc::new(ManualClock::starting_at_test_epoch());
        let processor = processor(&parts, 10).with_clock(clock.clone());

        processor.poll_once().await.unwrap();
        assert_eq!(processor.poll_once().await.unwrap().processed, 0);

        clock.advance(Duration::from_secs(3600));
        processor.reset().await.unwrap();
        let position = parts.2.load_position("docs").await.unwrap().unwrap();
        assert_eq!(position.sequence, 0);
        assert_eq!(position.timestamp, clock.now());

        assert_eq!(processor.poll_once().await.unwrap().processed, 1);
        assert_eq!(parts.1.handled_sequences(), vec![1, 1]);
    }
}
