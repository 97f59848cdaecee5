//! Per-instrument limit order book: bid/ask price levels, id index and
//! the price-time matching walk.

use crate::calc::{self, InstrumentId, OrderId, Price, Quantity};
use crate::engine::error::EngineError;
use crate::engine::level::PriceLevel;
use crate::engine::types::{DepthLevel, DepthSnapshot, Order, SelfTradePolicy, Side};
use crossbeam::atomic::AtomicCell;
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::trace;

/// Result of a matching walk, beyond what the fill callback observed.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    /// Resting orders cancelled by the self-trade policy during this
    /// walk, in cancellation order.
    pub cancelled_makers: Vec<Arc<Order>>,
}

/// Bid and ask sides of one instrument.
///
/// Price levels live in ordered skip maps so the matching walk iterates
/// levels in price priority without sorting: asks ascending, bids
/// descending via reverse iteration. An id index maps every resting order
/// to its `(price, side)` location for O(log P) removal.
///
/// Exactly one matching thread mutates a book; concurrent readers
/// (depth queries, risk sweeps) see a consistent enough view through the
/// concurrent containers.
#[derive(Debug)]
pub struct OrderBook {
    instrument_id: InstrumentId,
    bids: SkipMap<Price, Arc<PriceLevel>>,
    asks: SkipMap<Price, Arc<PriceLevel>>,
    order_locations: DashMap<OrderId, (Price, Side)>,

    // Best-price cache, invalidated on every mutation. Zero = invalid;
    // resting prices are strictly positive.
    cached_best_bid: AtomicI64,
    cached_best_ask: AtomicI64,

    last_trade_price: AtomicCell<Price>,
    has_traded: AtomicBool,
}

impl OrderBook {
    /// Create an empty book for `instrument_id`.
    #[must_use]
    pub fn new(instrument_id: InstrumentId) -> Self {
        Self {
            instrument_id,
            bids: SkipMap::new(),
            asks: SkipMap::new(),
            order_locations: DashMap::new(),
            cached_best_bid: AtomicI64::new(0),
            cached_best_ask: AtomicI64::new(0),
            last_trade_price: AtomicCell::new(0),
            has_traded: AtomicBool::new(false),
        }
    }

    /// The instrument this book belongs to.
    #[inline]
    #[must_use]
    pub fn instrument_id(&self) -> InstrumentId {
        self.instrument_id
    }

    /// Whether the given order id is resting in this book.
    #[inline]
    #[must_use]
    pub fn contains(&self, order_id: &OrderId) -> bool {
        self.order_locations.contains_key(order_id)
    }

    /// Look up a resting order by id.
    #[must_use]
    pub fn get(&self, order_id: &OrderId) -> Option<Arc<Order>> {
        let location = self.order_locations.get(order_id)?;
        let (price, side) = *location;
        drop(location);
        let levels = self.side_levels(side);
        let entry = levels.get(&price)?;
        entry.value().iter_orders().into_iter().find(|o| o.order_id == *order_id)
    }

    /// Insert a resting order at the tail of its price level.
    ///
    /// # Errors
    /// [`EngineError::DuplicateOrderId`] when the id is already resting.
    pub fn insert(&self, order: Arc<Order>) -> Result<(), EngineError> {
        let id = order.order_id;
        if self.order_locations.contains_key(&id) {
            return Err(EngineError::DuplicateOrderId(id));
        }
        let price = order.price;
        let side = order.side;
        let levels = self.side_levels(side);
        let entry = levels.get_or_insert_with(price, || Arc::new(PriceLevel::new(price)));
        entry.value().push(order);
        self.order_locations.insert(id, (price, side));
        self.invalidate_cache();
        trace!(
            "book {}: inserted order {} {} {}@{}",
            self.instrument_id, id, side, price, entry.value().total_quantity()
        );
        Ok(())
    }

    /// Remove a resting order by id, dropping its level if it empties.
    pub fn remove(&self, order_id: &OrderId) -> Option<Arc<Order>> {
        let (_, (price, side)) = self.order_locations.remove(order_id)?;
        let levels = self.side_levels(side);
        let removed = match levels.get(&price) {
            Some(entry) => {
                let level = entry.value();
                let removed = level.remove(order_id);
                if level.is_empty() {
                    entry.remove();
                }
                removed
            }
            None => None,
        };
        self.invalidate_cache();
        removed
    }

    /// Best (highest) bid price.
    #[must_use]
    pub fn best_bid(&self) -> Option<Price> {
        let cached = self.cached_best_bid.load(Ordering::Acquire);
        if cached != 0 {
            return Some(cached);
        }
        let best = self.bids.back().map(|entry| *entry.key());
        if let Some(price) = best {
            self.cached_best_bid.store(price, Ordering::Release);
        }
        best
    }

    /// Best (lowest) ask price.
    #[must_use]
    pub fn best_ask(&self) -> Option<Price> {
        let cached = self.cached_best_ask.load(Ordering::Acquire);
        if cached != 0 {
            return Some(cached);
        }
        let best = self.asks.front().map(|entry| *entry.key());
        if let Some(price) = best {
            self.cached_best_ask.store(price, Ordering::Release);
        }
        best
    }

    /// The level at the best price of `side`, if any.
    #[must_use]
    pub fn best_level(&self, side: Side) -> Option<Arc<PriceLevel>> {
        match side {
            Side::Buy => self.bids.back().map(|e| Arc::clone(e.value())),
            Side::Sell => self.asks.front().map(|e| Arc::clone(e.value())),
        }
    }

    /// Price of the most recent trade in this book.
    #[must_use]
    pub fn last_trade_price(&self) -> Option<Price> {
        if self.has_traded.load(Ordering::Relaxed) {
            Some(self.last_trade_price.load())
        } else {
            None
        }
    }

    /// Seed the last trade price from a snapshot. Zero means no trade
    /// had occurred.
    pub fn restore_last_trade(&self, price: Price) {
        if price != 0 {
            self.last_trade_price.store(price);
            self.has_traded.store(true, Ordering::Relaxed);
        }
    }

    /// Aggregated top-`levels` depth of both sides.
    #[must_use]
    pub fn depth(&self, levels: usize) -> DepthSnapshot {
        let collect = |side: Side| -> Vec<DepthLevel> {
            let map = self.side_levels(side);
            let iter: Box<dyn Iterator<Item = _>> = match side {
                Side::Buy => Box::new(map.iter().rev()),
                Side::Sell => Box::new(map.iter()),
            };
            iter.take(levels)
                .map(|entry| {
                    let level = entry.value();
                    DepthLevel {
                        price: *entry.key(),
                        quantity: level.total_quantity(),
                        order_count: level.order_count(),
                    }
                })
                .collect()
        };
        DepthSnapshot {
            instrument_id: self.instrument_id,
            bids: collect(Side::Buy),
            asks: collect(Side::Sell),
            last_trade_price: self.last_trade_price(),
        }
    }

    /// Total number of resting orders.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.order_locations.len()
    }

    /// All resting orders of both sides, in admission-sequence order.
    /// Used for snapshots; not a matching-path operation.
    #[must_use]
    pub fn resting_orders(&self) -> Vec<Arc<Order>> {
        let mut orders: Vec<Arc<Order>> = Vec::with_capacity(self.order_locations.len());
        for map in [&self.bids, &self.asks] {
            for entry in map.iter() {
                orders.extend(entry.value().iter_orders());
            }
        }
        orders.sort_by_key(|o| o.sequence());
        orders
    }

    /// Quantity available on the side *opposite* `taker_side` at prices a
    /// taker limited to `limit_price` could match, capped at `cap`.
    ///
    /// Used for the fill-or-kill pre-check; walks only as many levels as
    /// needed to reach the cap.
    #[must_use]
    pub fn matchable_quantity(&self, taker_side: Side, limit_price: Price, cap: Quantity) -> Quantity {
        let opposite = self.side_levels(taker_side.opposite());
        if opposite.is_empty() {
            return 0;
        }
        let iter: Box<dyn Iterator<Item = _>> = match taker_side {
            Side::Buy => Box::new(opposite.iter()),
            Side::Sell => Box::new(opposite.iter().rev()),
        };
        let mut available: Quantity = 0;
        for entry in iter {
            if available >= cap {
                break;
            }
            if !calc::can_match(limit_price, *entry.key(), taker_side.is_buy()) {
                break;
            }
            available = available.saturating_add(entry.value().total_quantity());
        }
        available.min(cap)
    }

    /// Drive the price-time matching walk for `taker`.
    ///
    /// Levels on the opposite side are visited best-first; within a level
    /// the FIFO head matches first. Each fill decrements both orders and
    /// invokes `on_fill(maker, qty, price)`. Exhausted makers and emptied
    /// levels are removed. The walk stops when the taker is satisfied or
    /// no remaining level crosses.
    ///
    /// Under [`SelfTradePolicy::CancelResting`], a head maker owned by
    /// the taker's user is cancelled instead of matched and the walk
    /// continues with the next queue position.
    pub fn match_against<F>(
        &self,
        taker: &Arc<Order>,
        policy: SelfTradePolicy,
        mut on_fill: F,
    ) -> MatchOutcome
    where
        F: FnMut(&Arc<Order>, Quantity, Price),
    {
        self.invalidate_cache();
        let mut outcome = MatchOutcome::default();
        let opposite = self.side_levels(taker.side.opposite());
        if opposite.is_empty() {
            return outcome;
        }

        let is_buy = taker.side.is_buy();
        let mut empty_levels: Vec<Price> = Vec::new();

        let level_iter: Box<dyn Iterator<Item = _>> = match taker.side {
            Side::Buy => Box::new(opposite.iter()),
            Side::Sell => Box::new(opposite.iter().rev()),
        };

        for entry in level_iter {
            let price = *entry.key();
            if !calc::can_match(taker.price, price, is_buy) {
                break;
            }
            let level = entry.value();

            while taker.remaining() > 0 {
                let maker = match level.front() {
                    Some(maker) => maker,
                    None => break,
                };

                if maker.user_id == taker.user_id
                    && matches!(policy, SelfTradePolicy::CancelResting)
                {
                    level.remove(&maker.order_id);
                    self.order_locations.remove(&maker.order_id);
                    maker.transition(crate::engine::types::OrderStatus::Cancelled);
                    trace!(
                        "book {}: self-trade cancel of resting order {}",
                        self.instrument_id, maker.order_id
                    );
                    outcome.cancelled_makers.push(maker);
                    continue;
                }

                let qty = calc::trade_qty(taker.remaining(), maker.remaining());
                if qty == 0 {
                    break;
                }

                maker.record_fill(qty);
                taker.record_fill(qty);
                level.on_fill(qty);
                self.last_trade_price.store(price);
                self.has_traded.store(true, Ordering::Relaxed);

                on_fill(&maker, qty, price);

                if maker.remaining() == 0 {
                    level.remove(&maker.order_id);
                    self.order_locations.remove(&maker.order_id);
                }
            }

            if level.is_empty() {
                empty_levels.push(price);
            }
            if taker.remaining() == 0 {
                break;
            }
        }

        for price in &empty_levels {
            opposite.remove(price);
        }

        outcome
    }

    /// Apply a known fill of `qty` to a resting order, removing it when
    /// exhausted. Used by the replay rebuilder, which applies recorded
    /// fills instead of re-running the matching walk.
    ///
    /// # Errors
    /// [`EngineError::OrderNotFound`] when the order is not resting.
    pub fn reduce(&self, order_id: &OrderId, qty: Quantity) -> Result<(), EngineError> {
        let location = self
            .order_locations
            .get(order_id)
            .map(|entry| *entry.value())
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        let (price, side) = location;
        let levels = self.side_levels(side);
        let entry = levels
            .get(&price)
            .ok_or(EngineError::OrderNotFound(*order_id))?;
        let level = entry.value();
        let order = level
            .iter_orders()
            .into_iter()
            .find(|o| o.order_id == *order_id)
            .ok_or(EngineError::OrderNotFound(*order_id))?;

        order.record_fill(qty);
        level.on_fill(qty);
        self.last_trade_price.store(price);
        self.has_traded.store(true, Ordering::Relaxed);
        if order.remaining() == 0 {
            level.remove(order_id);
            self.order_locations.remove(order_id);
        }
        if level.is_empty() {
            entry.remove();
        }
        self.invalidate_cache();
        Ok(())
    }

    #[inline]
    fn side_levels(&self, side: Side) -> &SkipMap<Price, Arc<PriceLevel>> {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    #[inline]
    fn invalidate_cache(&self) {
        self.cached_best_bid.store(0, Ordering::Release);
        self.cached_best_ask.store(0, Ordering::Release);
    }
}
