//! Change feed abstractions: reacting to mutations of a data store.
//!
//! # Overview
//!
//! A store that supports change streams appends one [`ChangeRecord`] per
//! mutation to an ordered feed. A change-stream processor reads the feed,
//! turns each record into a [`ChangeNotification`] and hands it to a
//! [`ChangeHandler`]. Progress is tracked per processor with a
//! [`ChangeCheckpoint`]:
//!
//! ```text
//! ┌──────────────┐  append   ┌──────────────┐  read_after(checkpoint)  ┌───────────┐
//! │ Order Store  │ ────────► │ Change Feed  │ ───────────────────────► │ Processor │
//! └──────────────┘           └──────────────┘                          └─────┬─────┘
//!                                                                  ┌─────────┴────────┐
//!                                                                  ▼                  ▼
//!                                                            ┌──────────┐      ┌────────────┐
//!                                                            │ Handler  │      │ Checkpoint │
//!                                                            └──────────┘      └────────────┘
//! ```
//!
//! ## Checkpoint semantics
//!
//! - The checkpoint holds the sequence of the last record handled successfully
//! - Records at or below the checkpoint are never handed out again
//! - Records above it are never skipped: processing stops at the first
//!   failure and resumes from the same record on the next poll
//!
//! A crash between handling a record and saving the checkpoint replays that
//! one record (at-least-once per processor).

use crate::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error type for change stream operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChangeStreamError {
    /// Reading the feed failed
    #[error("Change feed error: {0}")]
    Feed(String),

    /// Loading or saving a checkpoint failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A record lacks the images its kind requires
    #[error("Malformed change record {sequence}: {reason}")]
    MalformedRecord {
        /// Sequence of the offending record
        sequence: u64,
        /// What is missing
        reason: String,
    },

    /// The handler rejected a notification
    #[error("Handler failed on change record {sequence}: {reason}")]
    Handler {
        /// Sequence of the record being handled
        sequence: u64,
        /// Handler error message
        reason: String,
    },
}

/// Result type for change stream operations.
pub type Result<T> = std::result::Result<T, ChangeStreamError>;

/// Kind of mutation a change record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// A new item was written.
    Insert,
    /// An existing item was replaced.
    Modify,
    /// An item was deleted.
    Remove,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "INSERT"),
            Self::Modify => write!(f, "MODIFY"),
            Self::Remove => write!(f, "REMOVE"),
        }
    }
}

/// One mutation in a change feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord<T> {
    /// Position in the feed (strictly increasing, starting at 1).
    pub sequence: u64,
    /// Mutation kind.
    pub kind: ChangeKind,
    /// Item before the mutation (`Modify`, `Remove`).
    pub old_image: Option<T>,
    /// Item after the mutation (`Insert`, `Modify`).
    pub new_image: Option<T>,
    /// When the store recorded the mutation.
    pub recorded_at: DateTime<Utc>,
}

impl<T> ChangeRecord<T> {
    /// Record for a newly written item.
    #[must_use]
    pub const fn insert(sequence: u64, new_image: T, recorded_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            kind: ChangeKind::Insert,
            old_image: None,
            new_image: Some(new_image),
            recorded_at,
        }
    }

    /// Record for a replaced item.
    #[must_use]
    pub const fn modify(
        sequence: u64,
        old_image: T,
        new_image: T,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence,
            kind: ChangeKind::Modify,
            old_image: Some(old_image),
            new_image: Some(new_image),
            recorded_at,
        }
    }

    /// Record for a deleted item.
    #[must_use]
    pub const fn remove(sequence: u64, old_image: T, recorded_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            kind: ChangeKind::Remove,
            old_image: Some(old_image),
            new_image: None,
            recorded_at,
        }
    }

    /// Feed position reached once this record is handled.
    #[must_use]
    pub const fn position(&self) -> FeedPosition {
        FeedPosition::new(self.sequence, self.recorded_at)
    }
}

/// Field-level comparison between two snapshots of the same item.
pub trait Diff {
    /// Names of the fields whose values differ between `self` (old) and `other` (new).
    fn changed_fields(&self, other: &Self) -> Vec<&'static str>;
}

/// What a handler is told about a change record.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeNotification<T> {
    /// An item was inserted.
    Created {
        /// Feed position of the record
        sequence: u64,
        /// The new item
        item: T,
    },
    /// An item was modified.
    Updated {
        /// Feed position of the record
        sequence: u64,
        /// Item before the change
        before: T,
        /// Item after the change
        after: T,
        /// Fields that differ (see [`Diff`])
        changed: Vec<&'static str>,
    },
    /// An item was removed.
    Deleted {
        /// Feed position of the record
        sequence: u64,
        /// The item as it was before deletion
        item: T,
    },
}

impl<T: Diff + Clone> ChangeNotification<T> {
    /// Build the notification for `record`, diffing old and new images on modify.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::MalformedRecord`] if an image required by
    /// the record's kind is missing.
    pub fn from_record(record: &ChangeRecord<T>) -> Result<Self> {
        let missing = |image: &str| ChangeStreamError::MalformedRecord {
            sequence: record.sequence,
            reason: format!("{} record without {image} image", record.kind),
        };
        let sequence = record.sequence;

        match record.kind {
            ChangeKind::Insert => {
                let item = record.new_image.clone().ok_or_else(|| missing("new"))?;
                Ok(Self::Created { sequence, item })
            }
            ChangeKind::Modify => {
                let before = record.old_image.clone().ok_or_else(|| missing("old"))?;
                let after = record.new_image.clone().ok_or_else(|| missing("new"))?;
                let changed = before.changed_fields(&after);
                Ok(Self::Updated {
                    sequence,
                    before,
                    after,
                    changed,
                })
            }
            ChangeKind::Remove => {
                let item = record.old_image.clone().ok_or_else(|| missing("old"))?;
                Ok(Self::Deleted { sequence, item })
            }
        }
    }
}

impl<T> ChangeNotification<T> {
    /// Feed position of the underlying record.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        match self {
            Self::Created { sequence, .. }
            | Self::Updated { sequence, .. }
            | Self::Deleted { sequence, .. } => *sequence,
        }
    }

    /// Mutation kind of the underlying record.
    #[must_use]
    pub const fn kind(&self) -> ChangeKind {
        match self {
            Self::Created { .. } => ChangeKind::Insert,
            Self::Updated { .. } => ChangeKind::Modify,
            Self::Deleted { .. } => ChangeKind::Remove,
        }
    }
}

/// Position in a change feed (for checkpoint resumption).
///
/// # Example
///
/// ```
/// use orderflow_core::change_stream::FeedPosition;
/// use chrono::Utc;
///
/// let position = FeedPosition::new(42, Utc::now());
/// assert_eq!(position.sequence, 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPosition {
    /// Sequence of the last handled record.
    pub sequence: u64,

    /// When that record was recorded.
    pub timestamp: DateTime<Utc>,
}

impl FeedPosition {
    /// Create a new feed position.
    #[must_use]
    pub const fn new(sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence,
            timestamp,
        }
    }
}

/// Ordered source of change records.
pub trait ChangeFeed<T>: Send + Sync {
    /// Read up to `limit` records with sequence strictly greater than `after`
    /// (`None` reads from the beginning), in feed order.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::Feed`] if the feed cannot be read.
    fn read_after(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChangeRecord<T>>>>;
}

/// Durable progress tracking for change-stream processors.
///
/// # Dyn Compatibility
///
/// Returns boxed futures so processors can hold `Arc<dyn ChangeCheckpoint>`.
pub trait ChangeCheckpoint: Send + Sync {
    /// Record that `processor` has handled everything up to `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::Checkpoint`] if the save fails.
    fn save_position(
        &self,
        processor: &str,
        position: FeedPosition,
    ) -> BoxFuture<'_, Result<()>>;

    /// Last saved position of `processor`, `None` if it never saved one.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::Checkpoint`] if the load fails.
    fn load_position(&self, processor: &str) -> BoxFuture<'_, Result<Option<FeedPosition>>>;
}

/// Reacts to change notifications.
pub trait ChangeHandler<T>: Send + Sync {
    /// Handler name (also the checkpoint key of the processor running it).
    fn name(&self) -> &str;

    /// React to one notification.
    ///
    /// # Errors
    ///
    /// Returns [`ChangeStreamError::Handler`] to stop the processor at this
    /// record; it is retried on the next poll.
    fn handle<'a>(&'a self, notification: &'a ChangeNotification<T>) -> BoxFuture<'a, Result<()>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Item {
        status: &'static str,
        score: u32,
    }

    impl Diff for Item {
        fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
            let mut changed = Vec::new();
            if self.status != other.status {
                changed.push("status");
            }
            if self.score != other.score {
                changed.push("score");
            }
            changed
        }
    }

    #[test]
    fn modify_notification_lists_changed_fields() {
        let record = ChangeRecord::modify(
            7,
            Item { status: "confirmed", score: 0 },
            Item { status: "shipped", score: 0 },
            Utc::now(),
        );

        let notification = ChangeNotification::from_record(&record).unwrap();
        match notification {
            ChangeNotification::Updated { changed, sequence, .. } => {
                assert_eq!(sequence, 7);
                assert_eq!(changed, vec!["status"]);
            }
            other => unreachable!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn insert_and_remove_map_to_created_and_deleted() {
        let item = Item { status: "created", score: 1 };
        let insert = ChangeRecord::insert(1, item.clone(), Utc::now());
        let remove = ChangeRecord::remove(2, item, Utc::now());

        assert_eq!(
            ChangeNotification::from_record(&insert).unwrap().kind(),
            ChangeKind::Insert
        );
        assert_eq!(
            ChangeNotification::from_record(&remove).unwrap().kind(),
            ChangeKind::Remove
        );
    }

    #[test]
    fn missing_image_is_malformed() {
        let mut record = ChangeRecord::insert(3, Item { status: "x", score: 0 }, Utc::now());
        record.new_image = None;

        let err = ChangeNotification::from_record(&record).unwrap_err();
        assert!(matches!(err, ChangeStreamError::MalformedRecord { sequence: 3, .. }));
    }
}
