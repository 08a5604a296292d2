//! `OrderStore`: the order table and its change feed, plus the
//! [`CheckpointTable`] its stream processors resume from.
//!
//! Every mutation appends one [`ChangeRecord`] under the same lock that
//! applies it, so the feed order is the mutation order and sequences are
//! gap-free starting at 1.

use crate::error::{OrderError, Result};
use crate::types::{CustomerId, Order, OrderId};
use orderflow_core::BoxFuture;
use orderflow_core::change_stream::{
    self, ChangeCheckpoint, ChangeFeed, ChangeRecord, FeedPosition,
};
use orderflow_core::environment::{Clock, SystemClock};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Maximum number of orders returned by [`OrderStore::list_for_customer`].
pub const LIST_LIMIT: usize = 20;

#[derive(Default)]
struct Inner {
    /// Order plus its insertion rank (tie-breaker for equal timestamps).
    orders: HashMap<OrderId, (u64, Order)>,
    feed: Vec<ChangeRecord<Order>>,
    inserted: u64,
}

impl Inner {
    fn next_sequence(&self) -> u64 {
        self.feed.last().map_or(1, |r| r.sequence + 1)
    }
}

/// In-memory order table with an append-only change feed.
pub struct OrderStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OrderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("OrderStore")
            .field("orders", &inner.orders.len())
            .field("feed", &inner.feed.len())
            .finish_non_exhaustive()
    }
}

impl Default for OrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderStore {
    /// Store reading time from the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Store reading time from `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    /// Persist a new order.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::Validation`] if an order with the same id exists.
    pub fn insert(&self, order: Order) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.orders.contains_key(&order.order_id) {
            return Err(OrderError::Validation(format!(
                "order {} already exists",
                order.order_id
            )));
        }
        let sequence = inner.next_sequence();
        let rank = inner.inserted;
        inner.inserted += 1;
        inner
            .feed
            .push(ChangeRecord::insert(sequence, order.clone(), self.clock.now()));
        inner.orders.insert(order.order_id.clone(), (rank, order));
        Ok(())
    }

    /// Apply `mutate` to a copy of the order and store it if it returns `Ok`.
    ///
    /// Stamps `updated_at` and appends a modify record. Returns the stored order.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::OrderNotFound`] or the error from `mutate`, in
    /// which case nothing is written.
    pub fn update<F>(&self, order_id: &OrderId, mutate: F) -> Result<Order>
    where
        F: FnOnce(&mut Order) -> Result<()>,
    {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner
            .orders
            .get(order_id)
            .map(|(_, order)| order.clone())
            .ok_or_else(|| OrderError::OrderNotFound(order_id.clone()))?;

        let mut after = before.clone();
        mutate(&mut after)?;
        after.updated_at = now;

        let sequence = inner.next_sequence();
        inner
            .feed
            .push(ChangeRecord::modify(sequence, before, after.clone(), now));
        if let Some(entry) = inner.orders.get_mut(order_id) {
            entry.1 = after.clone();
        }
        Ok(after)
    }

    /// Delete an order, appending a remove record.
    ///
    /// # Errors
    ///
    /// Returns [`OrderError::OrderNotFound`] for an unknown id.
    pub fn remove(&self, order_id: &OrderId) -> Result<Order> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let (_, order) = inner
            .orders
            .remove(order_id)
            .ok_or_else(|| OrderError::OrderNotFound(order_id.clone()))?;
        let sequence = inner.next_sequence();
        inner
            .feed
            .push(ChangeRecord::remove(sequence, order.clone(), self.clock.now()));
        Ok(order)
    }

    /// Look up an order.
    #[must_use]
    pub fn get(&self, order_id: &OrderId) -> Option<Order> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .orders
            .get(order_id)
            .map(|(_, order)| order.clone())
    }

    /// A customer's orders, newest first, at most [`LIST_LIMIT`].
    #[must_use]
    pub fn list_for_customer(&self, customer_id: &CustomerId) -> Vec<Order> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut orders: Vec<_> = inner
            .orders
            .values()
            .filter(|(_, order)| &order.customer_id == customer_id)
            .collect();
        orders.sort_by(|(rank_a, a), (rank_b, b)| {
            b.created_at.cmp(&a.created_at).then(rank_b.cmp(rank_a))
        });
        orders
            .into_iter()
            .take(LIST_LIMIT)
            .map(|(_, order)| order.clone())
            .collect()
    }

    /// Number of stored orders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).orders.len()
    }

    /// Whether the store holds no order.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence of the newest change record, `None` before the first mutation.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .feed
            .last()
            .map(|r| r.sequence)
    }
}

impl ChangeFeed<Order> for OrderStore {
    fn read_after(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> BoxFuture<'_, change_stream::Result<Vec<ChangeRecord<Order>>>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let start = after.map_or(0, |seq| inner.feed.partition_point(|r| r.sequence <= seq));
        let records = inner.feed[start..].iter().take(limit).cloned().collect();
        Box::pin(async move { Ok(records) })
    }
}

/// Stream processor positions, kept next to the order table.
#[derive(Debug, Default)]
pub struct CheckpointTable {
    positions: RwLock<HashMap<String, FeedPosition>>,
}

impl CheckpointTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Saved sequence of `processor`.
    #[must_use]
    pub fn sequence_of(&self, processor: &str) -> Option<u64> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(processor)
            .map(|p| p.sequence)
    }
}

impl ChangeCheckpoint for CheckpointTable {
    fn save_position(
        &self,
        processor: &str,
        position: FeedPosition,
    ) -> BoxFuture<'_, change_stream::Result<()>> {
        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(processor.to_string(), position);
        Box::pin(async { Ok(()) })
    }

    fn load_position(
        &self,
        processor: &str,
    ) -> BoxFuture<'_, change_stream::Result<Option<FeedPosition>>> {
        let position = self
            .positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(processor)
            .copied();
        Box::pin(async move { Ok(position) })
    }
}
