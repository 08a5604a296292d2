//! In-memory change-stream testing utilities
//!
//! Provides fast, deterministic doubles for change-stream processors:
//! - [`InMemoryChangeCheckpoint`]: checkpoint tracking, with injectable save failures
//! - [`InMemoryChangeFeed`]: an append-only feed the test writes to directly
//! - [`RecordingChangeHandler`]: records notifications, fails on chosen sequences

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use orderflow_core::BoxFuture;
use orderflow_core::change_stream::{
    ChangeCheckpoint, ChangeFeed, ChangeHandler, ChangeNotification, ChangeRecord,
    ChangeStreamError, FeedPosition, Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// In-memory checkpoint tracker for testing.
///
/// # Example
///
/// ```
/// use orderflow_testing::InMemoryChangeCheckpoint;
/// use orderflow_core::change_stream::{ChangeCheckpoint, FeedPosition};
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let checkpoint = InMemoryChangeCheckpoint::new();
///
/// checkpoint.save_position("order-stream", FeedPosition::new(3, Utc::now())).await?;
///
/// let position = checkpoint.load_position("order-stream").await?;
/// assert_eq!(position.map(|p| p.sequence), Some(3));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryChangeCheckpoint {
    positions: Arc<RwLock<HashMap<String, FeedPosition>>>,
    fail_saves: Arc<AtomicBool>,
}

impl InMemoryChangeCheckpoint {
    /// Create a new empty checkpoint tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail (or succeed again with `false`).
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Saved sequence of `processor`, if any.
    #[must_use]
    pub fn sequence_of(&self, processor: &str) -> Option<u64> {
        self.positions
            .read()
            .unwrap()
            .get(processor)
            .map(|p| p.sequence)
    }

    /// Get the number of tracked processors
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.read().unwrap().len()
    }

    /// Check if no processors are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.read().unwrap().is_empty()
    }
}

impl ChangeCheckpoint for InMemoryChangeCheckpoint {
    fn save_position(&self, processor: &str, position: FeedPosition) -> BoxFuture<'_, Result<()>> {
        let processor = processor.to_string();
        Box::pin(async move {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(ChangeStreamError::Checkpoint(format!(
                    "injected save failure for {processor}"
                )));
            }
            self.positions.write().unwrap().insert(processor, position);
            Ok(())
        })
    }

    fn load_position(&self, processor: &str) -> BoxFuture<'_, Result<Option<FeedPosition>>> {
        let processor = processor.to_string();
        Box::pin(async move { Ok(self.positions.read().unwrap().get(&processor).copied()) })
    }
}

/// Append-only change feed held in a `Vec`.
///
/// Sequences are assigned on [`InMemoryChangeFeed::push`], starting at 1.
#[derive(Debug)]
pub struct InMemoryChangeFeed<T> {
    records: RwLock<Vec<ChangeRecord<T>>>,
}

impl<T> Default for InMemoryChangeFeed<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Clone + Send + Sync> InMemoryChangeFeed<T> {
    /// Create an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `record`, overwriting its sequence with the next one. Returns the sequence.
    pub fn push(&self, mut record: ChangeRecord<T>) -> u64 {
        let mut records = self.records.write().unwrap();
        let sequence = records.len() as u64 + 1;
        record.sequence = sequence;
        records.push(record);
        sequence
    }

    /// Number of records in the feed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Whether the feed is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }
}

impl<T: Clone + Send + Sync> ChangeFeed<T> for InMemoryChangeFeed<T> {
    fn read_after(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChangeRecord<T>>>> {
        Box::pin(async move {
            let after = after.unwrap_or(0);
            Ok(self
                .records
                .read()
                .unwrap()
                .iter()
                .filter(|r| r.sequence > after)
                .take(limit)
                .cloned()
                .collect())
        })
    }
}

/// Handler that records every notification it accepts.
///
/// Sequences registered with [`RecordingChangeHandler::fail_on`] are rejected
/// until [`RecordingChangeHandler::recover`] clears them.
#[derive(Debug)]
pub struct RecordingChangeHandler<T> {
    name: String,
    handled: RwLock<Vec<ChangeNotification<T>>>,
    failing: RwLock<HashSet<u64>>,
}

impl<T: Clone + Send + Sync> RecordingChangeHandler<T> {
    /// Create a handler (its name is also its checkpoint key).
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handled: RwLock::new(Vec::new()),
            failing: RwLock::new(HashSet::new()),
        }
    }

    /// Reject the record with `sequence`.
    pub fn fail_on(&self, sequence: u64) {
        self.failing.write().unwrap().insert(sequence);
    }

    /// Stop rejecting anything.
    pub fn recover(&self) {
        self.failing.write().unwrap().clear();
    }

    /// Notifications accepted so far, in order.
    #[must_use]
    pub fn handled(&self) -> Vec<ChangeNotification<T>> {
        self.handled.read().unwrap().clone()
    }

    /// Sequences accepted so far, in order.
    #[must_use]
    pub fn handled_sequences(&self) -> Vec<u64> {
        self.handled
            .read()
            .unwrap()
            .iter()
            .map(ChangeNotification::sequence)
            .collect()
    }
}

impl<T: Clone + Send + Sync> ChangeHandler<T> for RecordingChangeHandler<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle<'a>(&'a self, notification: &'a ChangeNotification<T>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sequence = notification.sequence();
            if self.failing.read().unwrap().contains(&sequence) {
                return Err(ChangeStreamError::Handler {
                    sequence,
                    reason: "injected failure".to_string(),
                });
            }
            self.handled.write().unwrap().push(notification.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn feed_reads_strictly_after_position() {
        let feed = InMemoryChangeFeed::new();
        for value in ["a", "b", "c"] {
            feed.push(ChangeRecord::insert(0, value.to_string(), Utc::now()));
        }

        let all = feed.read_after(None, 10).await.unwrap();
        assert_eq!(all.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);

        let tail = feed.read_after(Some(1), 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence, 2);
    }

    #[tokio::test]
    async fn checkpoint_save_failure_is_injectable() {
        let checkpoint = InMemoryChangeCheckpoint::new();
        checkpoint.fail_saves(true);

        let result = checkpoint
            .save_position("p", FeedPosition::new(1, Utc::now()))
            .await;
        assert!(matches!(result, Err(ChangeStreamError::Checkpoint(_))));
        assert!(checkpoint.is_empty());
    }
}
