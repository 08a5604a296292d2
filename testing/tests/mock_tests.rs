//! Tests for the testing doubles used across the workspace.

#![allow(clippy::unwrap_used)] // Tests can unwrap

use orderflow_core::change_stream::{
    ChangeCheckpoint, ChangeFeed, ChangeHandler, ChangeKind, ChangeNotification, ChangeRecord, Diff,
    FeedPosition,
};
use orderflow_core::consumer::MessageHandler;
use orderflow_core::environment::Clock;
use orderflow_core::event::{Event, EventType};
use orderflow_core::queue::QueueMessage;
use orderflow_testing::{
    InMemoryChangeCheckpoint, InMemoryChangeFeed, ManualClock, RecordingChangeHandler,
    RecordingHandler, test_clock,
};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
struct Row {
    id: u32,
    label: &'static str,
}

impl Diff for Row {
    fn changed_fields(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.label != other.label {
            changed.push("label");
        }
        changed
    }
}

#[tokio::test]
async fn feed_assigns_sequences_on_push() {
    let feed = InMemoryChangeFeed::new();
    let now = test_clock().now();
    let a = Row { id: 1, label: "a" };
    let b = Row { id: 1, label: "b" };

    assert_eq!(feed.push(ChangeRecord::insert(99, a.clone(), now)), 1);
    assert_eq!(feed.push(ChangeRecord::modify(0, a, b.clone(), now)), 2);
    assert_eq!(feed.push(ChangeRecord::remove(0, b, now)), 3);

    let kinds: Vec<_> = feed.read_after(None, 10).await.unwrap().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Modify, ChangeKind::Remove]);
    assert_eq!(feed.read_after(Some(2), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn recording_change_handler_fails_until_recovered() {
    let handler = RecordingChangeHandler::new("rows");
    let now = test_clock().now();
    let record = ChangeRecord::modify(4, Row { id: 1, label: "a" }, Row { id: 1, label: "b" }, now);
    let notification = ChangeNotification::from_record(&record).unwrap();

    handler.fail_on(4);
    assert!(handler.handle(&notification).await.is_err());
    assert!(handler.handled().is_empty());

    handler.recover();
    handler.handle(&notification).await.unwrap();
    assert_eq!(handler.handled_sequences(), vec![4]);
    assert!(matches!(
        &handler.handled()[0],
        ChangeNotification::Updated { changed, .. } if changed == &vec!["label"]
    ));
}

#[tokio::test]
async fn checkpoint_is_per_processor() {
    let checkpoint = InMemoryChangeCheckpoint::new();
    let now = test_clock().now();

    checkpoint.save_position("a", FeedPosition::new(3, now)).await.unwrap();
    checkpoint.save_position("b", FeedPosition::new(7, now)).await.unwrap();

    assert_eq!(checkpoint.sequence_of("a"), Some(3));
    assert_eq!(checkpoint.load_position("b").await.unwrap().map(|p| p.sequence), Some(7));
    assert_eq!(checkpoint.len(), 2);

    checkpoint.fail_saves(true);
    assert!(checkpoint.save_position("a", FeedPosition::new(4, now)).await.is_err());
    assert_eq!(checkpoint.sequence_of("a"), Some(3));
}

#[tokio::test]
async fn recording_handler_counts_effects_by_idempotency_key() {
    let handler = RecordingHandler::new("email").failing_first(1);
    let event = Event::new(EventType::OrderShipped, "o-1", "c-1", test_clock().now());
    let message = QueueMessage::new(event.clone(), test_clock().now());

    assert!(handler.handle(&message).await.is_err());
    handler.handle(&message).await.unwrap();
    handler.handle(&message).await.unwrap();

    assert_eq!(handler.attempts_for(&message.id), 3);
    assert_eq!(handler.effect_count(), 1);
    assert_eq!(handler.times_seen(&event.idempotency_key()), 2);
}

#[test]
fn manual_clock_moves_only_when_told() {
    let clock = ManualClock::starting_at_test_epoch();
    assert_eq!(clock.now(), test_clock().now());
    clock.advance(Duration::from_secs(90));
    assert_eq!((clock.now() - test_clock().now()).num_seconds(), 90);
}
