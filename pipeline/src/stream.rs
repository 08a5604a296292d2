//! Change-stream reactions to order store mutations.
//!
//! - insert: index the order under its customer
//! - modify: report changed fields, status changes, and fraud scores that
//!   need review
//! - remove: audit the deletion and evict the order from the customer index

use crate::types::{Order, OrderId, OrderStatus};
use orderflow_core::BoxFuture;
use orderflow_core::change_stream::{ChangeHandler, ChangeNotification, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

/// Something the stream handler reported downstream.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamNotification {
    /// A new order was persisted.
    Created {
        /// Feed position
        sequence: u64,
        /// Order
        order_id: OrderId,
        /// Owner
        customer_id: String,
    },
    /// An order was modified.
    Updated {
        /// Feed position
        sequence: u64,
        /// Order
        order_id: OrderId,
        /// Fields that differ between the old and new image
        changed: Vec<&'static str>,
    },
    /// An order changed status.
    StatusChanged {
        /// Feed position
        sequence: u64,
        /// Order
        order_id: OrderId,
        /// Old status
        from: OrderStatus,
        /// New status
        to: OrderStatus,
    },
    /// A fraud score at or above the review threshold was stored.
    FraudReview {
        /// Feed position
        sequence: u64,
        /// Order
        order_id: OrderId,
        /// Stored score
        score: f64,
    },
    /// An order was deleted.
    Deleted {
        /// Feed position
        sequence: u64,
        /// Order
        order_id: OrderId,
        /// Status at deletion
        final_status: OrderStatus,
    },
}

impl StreamNotification {
    /// Feed position that produced this notification.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        match self {
            Self::Created { sequence, .. }
            | Self::Updated { sequence, .. }
            | Self::StatusChanged { sequence, .. }
            | Self::FraudReview { sequence, .. }
            | Self::Deleted { sequence, .. } => *sequence,
        }
    }
}

#[derive(Default)]
struct State {
    customer_orders: HashMap<String, BTreeSet<OrderId>>,
    notifications: Vec<StreamNotification>,
}

/// [`ChangeHandler`] for the order store's change feed.
pub struct OrderChangeHandler {
    review_threshold: f64,
    state: Mutex<State>,
}

impl std::fmt::Debug for OrderChangeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderChangeHandler")
            .field("review_threshold", &self.review_threshold)
            .finish_non_exhaustive()
    }
}

impl Default for OrderChangeHandler {
    fn default() -> Self {
        Self::new(0.7)
    }
}

impl OrderChangeHandler {
    /// Handler flagging fraud scores at or above `review_threshold`.
    #[must_use]
    pub fn new(review_threshold: f64) -> Self {
        Self {
            review_threshold,
            state: Mutex::new(State::default()),
        }
    }

    /// Notifications emitted so far, in feed order.
    #[must_use]
    pub fn notifications(&self) -> Vec<StreamNotification> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .notifications
            .clone()
    }

    /// Cached order ids of a customer.
    #[must_use]
    pub fn customer_orders(&self, customer_id: &str) -> Vec<OrderId> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .customer_orders
            .get(customer_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn react(&self, notification: &ChangeNotification<Order>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut emitted = Vec::new();

        match notification {
            ChangeNotification::Created { sequence, item } => {
                state
                    .customer_orders
                    .entry(item.customer_id.to_string())
                    .or_default()
                    .insert(item.order_id.clone());
                tracing::info!(
                    order_id = %item.order_id,
                    customer_id = %item.customer_id,
                    "New order detected"
                );
                emitted.push(StreamNotification::Created {
                    sequence: *sequence,
                    order_id: item.order_id.clone(),
                    customer_id: item.customer_id.to_string(),
                });
            }
            ChangeNotification::Updated {
                sequence,
                before,
                after,
                changed,
            } => {
                let sequence = *sequence;
                let order_id = after.order_id.clone();
                tracing::info!(order_id = %order_id, ?changed, "Order updated");
                emitted.push(StreamNotification::Updated {
                    sequence,
                    order_id: order_id.clone(),
                    changed: changed.clone(),
                });

                if before.status != after.status {
                    tracing::info!(
                        order_id = %order_id,
                        from = %before.status,
                        to = %after.status,
                        "Status changed"
                    );
                    emitted.push(StreamNotification::StatusChanged {
                        sequence,
                        order_id: order_id.clone(),
                        from: before.status,
                        to: after.status,
                    });
                }

                if let Some(score) = after.fraud_score {
                    if before.fraud_score != after.fraud_score && score >= self.review_threshold {
                        tracing::warn!(order_id = %order_id, score, "High risk order detected");
                        emitted.push(StreamNotification::FraudReview {
                            sequence,
                            order_id,
                            score,
                        });
                    }
                }
            }
            ChangeNotification::Deleted { sequence, item } => {
                if let Some(ids) = state.customer_orders.get_mut(item.customer_id.as_str()) {
                    ids.remove(&item.order_id);
                }
                tracing::info!(order_id = %item.order_id, status = %item.status, "Order deleted");
                emitted.push(StreamNotification::Deleted {
                    sequence: *sequence,
                    order_id: item.order_id.clone(),
                    final_status: item.status,
                });
            }
        }

        state.notifications.extend(emitted);
    }
}

impl ChangeHandler<Order> for OrderChangeHandler {
    fn name(&self) -> &str {
        "order-stream"
    }

    fn handle<'a>(
        &'a self,
        notification: &'a ChangeNotification<Order>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.react(notification);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::{CustomerId, FraudStatus};
    use orderflow_core::change_stream::{ChangeRecord, Diff};
    use orderflow_core::environment::Clock;
    use orderflow_testing::test_clock;

    fn order() -> Order {
        Order::new(
            OrderId::from("o-1"),
            CustomerId::from("c-1"),
            vec![],
            "card",
            test_clock().now(),
        )
    }

    async fn feed(handler: &OrderChangeHandler, record: &ChangeRecord<Order>) {
        let notification = ChangeNotification::from_record(record).unwrap();
        handler.handle(&notification).await.unwrap();
    }

    #[tokio::test]
    async fn insert_modify_remove() {
        let handler = OrderChangeHandler::default();
        let now = test_clock().now();
        let created = order();
        let mut confirmed = created.clone();
        confirmed.status = OrderStatus::Confirmed;
        confirmed.fraud_score = Some(0.8);
        confirmed.fraud_status = Some(FraudStatus::HighRiskPendingReview);

        feed(&handler, &ChangeRecord::insert(1, created.clone(), now)).await;
        assert_eq!(handler.customer_orders("c-1"), vec![OrderId::from("o-1")]);

        feed(&handler, &ChangeRecord::modify(2, created.clone(), confirmed.clone(), now)).await;
        feed(&handler, &ChangeRecord::remove(3, confirmed.clone(), now)).await;

        let notifications = handler.notifications();
        assert_eq!(notifications.len(), 5);
        assert!(matches!(notifications[0], StreamNotification::Created { sequence: 1, .. }));
        assert_eq!(
            notifications[1],
            StreamNotification::Updated {
                sequence: 2,
                order_id: OrderId::from("o-1"),
                changed: created.changed_fields(&confirmed),
            }
        );
        assert!(matches!(
            notifications[2],
            StreamNotification::StatusChanged {
                from: OrderStatus::Created,
                to: OrderStatus::Confirmed,
                ..
            }
        ));
        assert!(matches!(notifications[3], StreamNotification::FraudReview { .. }));
        assert!(matches!(
            notifications[4],
            StreamNotification::Deleted { sequence: 3, final_status: OrderStatus::Confirmed, .. }
        ));
        assert!(handler.customer_orders("c-1").is_empty());
    }

    #[tokio::test]
    async fn low_fraud_score_needs_no_review() {
        let handler = OrderChangeHandler::new(0.7);
        let before = order();
        let mut after = before.clone();
        after.fraud_score = Some(0.2);

        feed(&handler, &ChangeRecord::modify(1, before, after, test_clock().now())).await;
        let notifications = handler.notifications();
        assert_eq!(notifications.len(), 1);
        assert!(matches!(
            &notifications[0],
            StreamNotification::Updated { changed, .. } if changed == &vec!["fraud_score"]
        ));
    }
}
