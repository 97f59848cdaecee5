//! Core order, trade and report types for the matching engine.

use crate::calc::{InstrumentId, OrderId, Price, Quantity, SequenceId, TimestampNs, UserId};
use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use uuid::Uuid;

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Bid side.
    Buy,
    /// Ask side.
    Sell,
}

impl Side {
    /// The opposite side (the side an order matches against).
    #[inline]
    #[must_use]
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Whether this is the buy side.
    #[inline]
    #[must_use]
    pub fn is_buy(self) -> bool {
        matches!(self, Side::Buy)
    }

    /// Wire encoding for event payloads.
    #[inline]
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Side::Buy => 0,
            Side::Sell => 1,
        }
    }

    /// Decode from the wire representation.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Side> {
        match value {
            0 => Some(Side::Buy),
            1 => Some(Side::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Execution policy of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    /// Rests at its limit price after matching what it can.
    Limit,
    /// Price zero; sweeps the opposite side, never rests.
    Market,
    /// Rejected outright if any immediate match would occur.
    PostOnly,
    /// Matches what it can, remainder is cancelled.
    ImmediateOrCancel,
    /// All-or-nothing: rejected without mutation unless fully fillable.
    FillOrKill,
}

impl OrderKind {
    /// Whether an unfilled remainder of this kind rests in the book.
    #[inline]
    #[must_use]
    pub fn rests(self) -> bool {
        matches!(self, OrderKind::Limit | OrderKind::PostOnly)
    }

    /// Whether this kind requires a positive limit price.
    #[inline]
    #[must_use]
    pub fn requires_price(self) -> bool {
        !matches!(self, OrderKind::Market)
    }

    /// Wire encoding for event payloads.
    #[inline]
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            OrderKind::Limit => 0,
            OrderKind::Market => 1,
            OrderKind::PostOnly => 2,
            OrderKind::ImmediateOrCancel => 3,
            OrderKind::FillOrKill => 4,
        }
    }

    /// Decode from the wire representation.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<OrderKind> {
        match value {
            0 => Some(OrderKind::Limit),
            1 => Some(OrderKind::Market),
            2 => Some(OrderKind::PostOnly),
            3 => Some(OrderKind::ImmediateOrCancel),
            4 => Some(OrderKind::FillOrKill),
            _ => None,
        }
    }
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKind::Limit => write!(f, "LIMIT"),
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::PostOnly => write!(f, "POST_ONLY"),
            OrderKind::ImmediateOrCancel => write!(f, "IOC"),
            OrderKind::FillOrKill => write!(f, "FOK"),
        }
    }
}

/// Lifecycle status of an order.
///
/// Transitions are monotonic: `Pending -> PartialFilled -> (Filled |
/// Cancelled)`. `Rejected` is reachable only from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Admitted, no fills yet.
    Pending,
    /// At least one fill, remainder outstanding.
    PartialFilled,
    /// Fully executed.
    Filled,
    /// Removed with remainder outstanding.
    Cancelled,
    /// Refused before reaching the book.
    Rejected,
}

impl OrderStatus {
    /// Whether this status ends the order's lifecycle.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    /// Whether the lattice permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::Pending, OrderStatus::PartialFilled)
            | (OrderStatus::Pending, OrderStatus::Filled)
            | (OrderStatus::Pending, OrderStatus::Cancelled)
            | (OrderStatus::Pending, OrderStatus::Rejected)
            | (OrderStatus::PartialFilled, OrderStatus::PartialFilled)
            | (OrderStatus::PartialFilled, OrderStatus::Filled)
            | (OrderStatus::PartialFilled, OrderStatus::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::PartialFilled => write!(f, "PARTIAL_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Per-instrument policy when an incoming order would match a resting
/// order of the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SelfTradePolicy {
    /// Self-trades execute normally (default).
    #[default]
    Allow,
    /// The resting order is cancelled and the taker continues.
    CancelResting,
}

/// A live order.
///
/// Identity and terms are immutable; execution state (`filled`, `status`,
/// `sequence`) uses atomics so the single matching thread can mutate
/// through the shared `Arc` held by the book's level queues and id index.
#[derive(Debug)]
pub struct Order {
    /// Unique order identifier, assigned by the controller.
    pub order_id: OrderId,
    /// Caller-supplied idempotency id.
    pub client_order_id: Uuid,
    /// Owning user.
    pub user_id: UserId,
    /// Instrument this order trades.
    pub instrument_id: InstrumentId,
    /// Buy or sell.
    pub side: Side,
    /// Execution policy.
    pub kind: OrderKind,
    /// Scaled limit price; zero for market orders.
    pub price: Price,
    /// Scaled total quantity, strictly positive.
    pub quantity: Quantity,
    /// Price basis used for margin arithmetic (limit price, or the mark
    /// for market orders). Recorded in the placement event so replay
    /// recomputes identical freezes.
    pub margin_basis: Price,
    /// Set on liquidation takers: bypasses rate limits, never rests.
    pub is_liquidation: bool,

    filled: AtomicI64,
    status: AtomicCell<OrderStatus>,
    sequence: AtomicU64,
    timestamp_ns: AtomicI64,
}

impl Order {
    /// Create a new pending order.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        order_id: OrderId,
        client_order_id: Uuid,
        user_id: UserId,
        instrument_id: InstrumentId,
        side: Side,
        kind: OrderKind,
        price: Price,
        quantity: Quantity,
    ) -> Self {
        Self {
            order_id,
            client_order_id,
            user_id,
            instrument_id,
            side,
            kind,
            price,
            quantity,
            margin_basis: price,
            is_liquidation: false,
            filled: AtomicI64::new(0),
            status: AtomicCell::new(OrderStatus::Pending),
            sequence: AtomicU64::new(0),
            timestamp_ns: AtomicI64::new(0),
        }
    }

    /// Deterministic admission timestamp, derived from the placement
    /// sequence. Zero before admission.
    #[inline]
    #[must_use]
    pub fn timestamp_ns(&self) -> TimestampNs {
        self.timestamp_ns.load(Ordering::Acquire)
    }

    /// Record the deterministic admission timestamp.
    pub fn set_timestamp_ns(&self, timestamp_ns: TimestampNs) {
        self.timestamp_ns.store(timestamp_ns, Ordering::Release);
    }

    /// Quantity executed so far.
    #[inline]
    #[must_use]
    pub fn filled(&self) -> Quantity {
        self.filled.load(Ordering::Acquire)
    }

    /// Quantity still outstanding: `quantity - filled`.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> Quantity {
        self.quantity - self.filled()
    }

    /// Current lifecycle status.
    #[inline]
    #[must_use]
    pub fn status(&self) -> OrderStatus {
        self.status.load()
    }

    /// Event-log sequence assigned on admission (zero before admission).
    #[inline]
    #[must_use]
    pub fn sequence(&self) -> SequenceId {
        self.sequence.load(Ordering::Acquire)
    }

    /// Record the admission sequence. Called once, by the matching
    /// thread, when the placement event is appended.
    pub fn assign_sequence(&self, sequence: SequenceId) {
        self.sequence.store(sequence, Ordering::Release);
    }

    /// Apply a fill of `qty`, moving the status to `PartialFilled` or
    /// `Filled` as appropriate. Returns the remaining quantity after the
    /// fill.
    pub fn record_fill(&self, qty: Quantity) -> Quantity {
        let filled = self.filled.fetch_add(qty, Ordering::AcqRel) + qty;
        let remaining = self.quantity - filled;
        if remaining == 0 {
            self.status.store(OrderStatus::Filled);
        } else {
            self.status.store(OrderStatus::PartialFilled);
        }
        remaining
    }

    /// Attempt a status transition, enforcing the lattice.
    ///
    /// Returns `true` when the transition was applied.
    pub fn transition(&self, next: OrderStatus) -> bool {
        let current = self.status.load();
        if current.can_transition_to(next) {
            self.status.store(next);
            true
        } else {
            false
        }
    }
}

/// An executed trade. Immutable once produced.
///
/// `sequence_id` comes from the engine's monotonic trade counter and is
/// assigned in strict execution order; the corresponding event-log
/// sequence is strictly greater or equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trade {
    /// Engine-assigned trade sequence, strictly increasing.
    pub sequence_id: u64,
    /// The buy-side order.
    pub buy_order_id: OrderId,
    /// The sell-side order.
    pub sell_order_id: OrderId,
    /// Owner of the buy-side order.
    pub buy_user_id: UserId,
    /// Owner of the sell-side order.
    pub sell_user_id: UserId,
    /// Instrument traded.
    pub instrument_id: InstrumentId,
    /// Execution price: the maker's price.
    pub price: Price,
    /// Executed quantity: `min(taker.remaining, maker.remaining)` at the
    /// execution instant.
    pub quantity: Quantity,
    /// Whether the aggressing side was the buyer.
    pub is_taker_buy: bool,
    /// Deterministic timestamp of the execution.
    pub timestamp_ns: TimestampNs,
}

/// Outcome of processing one inbound order.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// The processed order.
    pub order_id: OrderId,
    /// Caller-supplied idempotency id.
    pub client_order_id: Uuid,
    /// Final status after processing.
    pub status: OrderStatus,
    /// Trades produced, in execution order.
    pub trades: Vec<Trade>,
    /// Quantity left unexecuted (resting or cancelled).
    pub remaining: Quantity,
}

/// One aggregated price level of a depth snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Level price.
    pub price: Price,
    /// Total resting quantity at this price.
    pub quantity: Quantity,
    /// Number of resting orders at this price.
    pub order_count: usize,
}

/// Aggregated view of the top of the book, for market-data edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    /// Instrument this snapshot describes.
    pub instrument_id: InstrumentId,
    /// Bid levels, best (highest) first.
    pub bids: Vec<DepthLevel>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<DepthLevel>,
    /// Price of the most recent trade, if any.
    pub last_trade_price: Option<Price>,
}

impl DepthSnapshot {
    /// Serialize for the human-facing edge.
    ///
    /// # Errors
    /// Returns the underlying `serde_json` error message.
    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string(self).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(side: Side, kind: OrderKind, price: Price, qty: Quantity) -> Order {
        Order::new(1, Uuid::new_v4(), 7, 1, side, kind, price, qty)
    }

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::from_u8(Side::Sell.as_u8()), Some(Side::Sell));
        assert_eq!(Side::from_u8(9), None);
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            OrderKind::Limit,
            OrderKind::Market,
            OrderKind::PostOnly,
            OrderKind::ImmediateOrCancel,
            OrderKind::FillOrKill,
        ] {
            assert_eq!(OrderKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert!(OrderKind::Limit.rests());
        assert!(OrderKind::PostOnly.rests());
        assert!(!OrderKind::Market.rests());
        assert!(!OrderKind::ImmediateOrCancel.rests());
    }

    #[test]
    fn test_status_lattice() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(PartialFilled));
        assert!(Pending.can_transition_to(Rejected));
        assert!(PartialFilled.can_transition_to(Filled));
        assert!(PartialFilled.can_transition_to(Cancelled));
        assert!(!PartialFilled.can_transition_to(Rejected));
        assert!(!Filled.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(Filled.is_terminal());
        assert!(!PartialFilled.is_terminal());
    }

    #[test]
    fn test_record_fill_updates_status() {
        let o = order(Side::Buy, OrderKind::Limit, 100, 10);
        assert_eq!(o.status(), OrderStatus::Pending);
        assert_eq!(o.record_fill(4), 6);
        assert_eq!(o.status(), OrderStatus::PartialFilled);
        assert_eq!(o.filled(), 4);
        assert_eq!(o.remaining(), 6);
        assert_eq!(o.record_fill(6), 0);
        assert_eq!(o.status(), OrderStatus::Filled);
    }

    #[test]
    fn test_transition_enforces_lattice() {
        let o = order(Side::Sell, OrderKind::Limit, 100, 10);
        assert!(o.transition(OrderStatus::Cancelled));
        assert!(!o.transition(OrderStatus::Filled));
        assert_eq!(o.status(), OrderStatus::Cancelled);
    }

    #[test]
    fn test_sequence_assignment() {
        let o = order(Side::Buy, OrderKind::Limit, 100, 10);
        assert_eq!(o.sequence(), 0);
        o.assign_sequence(42);
        assert_eq!(o.sequence(), 42);
    }
}
