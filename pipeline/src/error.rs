//! Order processor errors.

use crate::types::{OrderId, OrderStatus};
use orderflow_core::event_bus::PublishError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the order processor.
///
/// Every variant maps to an HTTP-equivalent status code so an outer adapter
/// can translate it without inspecting messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    /// Bad input; not retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A requested product is not in the catalog.
    #[error("Product {0} not found")]
    ProductNotFound(String),

    /// No order with this id.
    #[error("Order {0} not found")]
    OrderNotFound(OrderId),

    /// The order's current status does not allow the requested transition.
    #[error("Order {order_id} in status '{from}' cannot move to '{to}'")]
    InvalidTransition {
        /// Order
        order_id: OrderId,
        /// Current status
        from: OrderStatus,
        /// Requested status
        to: OrderStatus,
    },

    /// The payment step exceeded its deadline. The order was marked failed
    /// and `order_failed` was published.
    #[error("Payment for order {order_id} timed out after {timeout:?}")]
    Timeout {
        /// Order that was marked failed
        order_id: OrderId,
        /// Deadline that expired
        timeout: Duration,
    },

    /// The order was persisted but its event did not reach every subscriber.
    #[error("Order {order_id} persisted as '{status}' but publish failed: {source}")]
    Publish {
        /// Persisted order
        order_id: OrderId,
        /// Its persisted status
        status: OrderStatus,
        /// Per-subscriber failures
        #[source]
        source: PublishError,
    },
}

impl OrderError {
    /// HTTP-equivalent status code.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::ProductNotFound(_) | Self::OrderNotFound(_) => 404,
            Self::InvalidTransition { .. } => 409,
            Self::Publish { .. } => 502,
            Self::Timeout { .. } => 504,
        }
    }

    /// Order this error refers to, when one was persisted.
    #[must_use]
    pub const fn order_id(&self) -> Option<&OrderId> {
        match self {
            Self::OrderNotFound(id)
            | Self::InvalidTransition { order_id: id, .. }
            | Self::Timeout { order_id: id, .. }
            | Self::Publish { order_id: id, .. } => Some(id),
            Self::Validation(_) | Self::ProductNotFound(_) => None,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(OrderError::Validation("empty".into()).status_code(), 400);
        assert_eq!(OrderError::ProductNotFound("prod-x".into()).status_code(), 404);
        let timeout = OrderError::Timeout {
            order_id: OrderId::from("o-1"),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(timeout.status_code(), 504);
        assert_eq!(timeout.order_id(), Some(&OrderId::from("o-1")));
    }
}
