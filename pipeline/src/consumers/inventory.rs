//! Inventory consumer: takes paid-for items out of stock.

use super::{Admission, IdempotencyLedger, required_attribute};
use crate::catalog::Catalog;
use crate::types::parse_items;
use orderflow_core::BoxFuture;
use orderflow_core::consumer::{MessageHandler, ProcessingError};
use orderflow_core::event::attributes;
use orderflow_core::queue::QueueMessage;
use std::sync::Arc;

/// Decrements catalog stock for every line item of an `order_created` event.
#[derive(Debug)]
pub struct InventoryConsumer {
    catalog: Arc<Catalog>,
    ledger: IdempotencyLedger,
}

impl InventoryConsumer {
    /// Consumer updating `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            ledger: IdempotencyLedger::new(),
        }
    }

    /// Number of orders whose stock update was applied.
    #[must_use]
    pub fn orders_applied(&self) -> usize {
        self.ledger.completed()
    }

    fn apply(&self, message: &QueueMessage) -> Result<(), ProcessingError> {
        let event = &message.event;
        let raw = required_attribute(event, attributes::ITEMS)?;
        let items = parse_items(raw).ok_or_else(|| {
            ProcessingError::InvalidMessage(format!("malformed items attribute: {raw}"))
        })?;
        // Validate every line before touching stock.
        if let Some((missing, _)) = items
            .iter()
            .find(|(product_id, _)| self.catalog.get_product(product_id).is_none())
        {
            return Err(ProcessingError::InvalidMessage(format!(
                "order {} references unknown product {missing}",
                event.order_id
            )));
        }

        let Admission::Fresh(claim) = self.ledger.admit(event)? else {
            tracing::debug!(order_id = %event.order_id, "Stock already updated for order");
            return Ok(());
        };

        for (product_id, quantity) in &items {
            if let Some(stock) = self.catalog.decrement_stock(product_id, *quantity) {
                tracing::debug!(
                    order_id = %event.order_id,
                    product_id,
                    quantity,
                    stock,
                    "Stock decremented"
                );
                if stock < 0 {
                    tracing::warn!(product_id, stock, "Stock oversold");
                }
            }
        }
        claim.complete();

        tracing::info!(
            order_id = %event.order_id,
            items = items.len(),
            "Inventory updated"
        );
        Ok(())
    }
}

impl MessageHandler for InventoryConsumer {
    fn name(&self) -> &str {
        "inventory"
    }

    fn handle<'a>(
        &'a self,
        message: &'a QueueMessage,
    ) -> BoxFuture<'a, Result<(), ProcessingError>> {
        Box::pin(async move { self.apply(message) })
    }
}
