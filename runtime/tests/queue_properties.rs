//! Property tests for redelivery and dead-lettering.

#![allow(clippy::unwrap_used)]

use orderflow_core::event::Event;
use orderflow_core::queue::DurableQueue;
use orderflow_runtime::{InMemoryQueue, QueueConfig};
use orderflow_testing::{ManualClock, properties};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const VISIBILITY: Duration = Duration::from_secs(30);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    /// Each message is acknowledged by its `succeeds_on`-th delivery or
    /// dead-lettered after `max` deliveries, never delivered more than `max` times.
    #[test]
    fn every_message_is_acked_or_dead_lettered(
        events in prop::collection::vec(properties::event(), 1..20),
        succeeds_on in prop::collection::vec(1u32..6, 20),
        max in 1u32..5,
    ) {
        let outcome = runtime().block_on(run_cycles(&events, &succeeds_on, max));
        let (deliveries, acked, dead) = outcome;

        let expected_dead = succeeds_on.iter().take(events.len()).filter(|&&n| n > max).count();
        prop_assert_eq!(dead, expected_dead);
        prop_assert_eq!(acked + dead, events.len());
        for (index, count) in deliveries {
            prop_assert!(count <= max);
            prop_assert_eq!(count, succeeds_on[index].min(max));
        }
    }
}

/// Drive the queue through timeout cycles. Returns deliveries per event
/// index, acknowledged count, dead-lettered count.
async fn run_cycles(
    events: &[Event],
    succeeds_on: &[u32],
    max: u32,
) -> (HashMap<usize, u32>, usize, usize) {
    let clock = Arc::new(ManualClock::starting_at_test_epoch());
    let queue = InMemoryQueue::with_clock(
        "prop",
        QueueConfig::default().with_max_delivery_count(max),
        clock.clone(),
    );

    let mut index_of = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        let id = queue.enqueue(event.clone()).await.unwrap();
        index_of.insert(id, index);
    }

    let mut deliveries = HashMap::new();
    let mut acked = 0;
    for _cycle in 0..=max {
        for message in queue.dequeue(usize::MAX, VISIBILITY).await.unwrap() {
            let index = index_of[&message.id];
            *deliveries.entry(index).or_insert(0) += 1;
            if message.delivery_count >= succeeds_on[index] {
                queue.acknowledge(message.receipt()).await.unwrap();
                acked += 1;
            }
        }
        clock.advance(VISIBILITY);
    }

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.depth(), 0);
    (deliveries, acked, stats.dead_lettered)
}
