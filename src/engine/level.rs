//! A single price level: a FIFO queue of resting orders at one price.

use crate::calc::{OrderId, Price, Quantity};
use crate::engine::types::Order;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Orders resting at one price, matched first-in-first-out.
///
/// The level combines a map keyed by order id (O(1) lookup and removal)
/// with an id queue that preserves admission order. Cancellation removes
/// from the map only; the queue entry becomes a tombstone that the next
/// [`front`](PriceLevel::front) call purges. `total_quantity` tracks the
/// sum of remaining quantities and must equal that sum at every quiescent
/// point.
#[derive(Debug)]
pub struct PriceLevel {
    price: Price,
    total_quantity: AtomicI64,
    orders: DashMap<OrderId, Arc<Order>>,
    fifo: Mutex<VecDeque<OrderId>>,
}

impl PriceLevel {
    /// Create an empty level at `price`.
    #[must_use]
    pub fn new(price: Price) -> Self {
        Self {
            price,
            total_quantity: AtomicI64::new(0),
            orders: DashMap::new(),
            fifo: Mutex::new(VecDeque::new()),
        }
    }

    /// The price of this level.
    #[inline]
    #[must_use]
    pub fn price(&self) -> Price {
        self.price
    }

    /// Sum of remaining quantities of all resting orders.
    #[inline]
    #[must_use]
    pub fn total_quantity(&self) -> Quantity {
        self.total_quantity.load(Ordering::Acquire)
    }

    /// Number of live orders at this level.
    #[inline]
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Whether the level holds no live orders.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Append an order at the tail of the queue, preserving time
    /// priority.
    pub fn push(&self, order: Arc<Order>) {
        let id = order.order_id;
        self.total_quantity
            .fetch_add(order.remaining(), Ordering::AcqRel);
        self.orders.insert(id, order);
        if let Ok(mut fifo) = self.fifo.lock() {
            fifo.push_back(id);
        }
    }

    /// Remove an order by id.
    ///
    /// The queue entry is left behind as a tombstone and purged lazily;
    /// the aggregate total is reduced by the order's remaining quantity
    /// at removal time.
    pub fn remove(&self, order_id: &OrderId) -> Option<Arc<Order>> {
        let (_, order) = self.orders.remove(order_id)?;
        self.total_quantity
            .fetch_sub(order.remaining(), Ordering::AcqRel);
        Some(order)
    }

    /// The order at the head of the queue, skipping and purging
    /// tombstones of orders removed elsewhere.
    #[must_use]
    pub fn front(&self) -> Option<Arc<Order>> {
        let mut fifo = self.fifo.lock().ok()?;
        while let Some(id) = fifo.front() {
            if let Some(order) = self.orders.get(id) {
                return Some(Arc::clone(order.value()));
            }
            fifo.pop_front();
        }
        None
    }

    /// Account for a fill of `qty` against an order at this level.
    pub fn on_fill(&self, qty: Quantity) {
        self.total_quantity.fetch_sub(qty, Ordering::AcqRel);
    }

    /// Live orders in FIFO order. Allocates; intended for snapshots and
    /// depth inspection, not the matching path.
    #[must_use]
    pub fn iter_orders(&self) -> Vec<Arc<Order>> {
        let fifo = match self.fifo.lock() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        fifo.iter()
            .filter_map(|id| self.orders.get(id).map(|entry| Arc::clone(entry.value())))
            .collect()
    }
}
