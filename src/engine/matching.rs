//! The matching engine: validates inbound orders, drives the book's
//! matching walk and emits the resulting events.
//!
//! One engine instance serves one instrument and is driven by exactly
//! one thread; the book's concurrent containers exist for readers, not
//! for competing writers. The engine can only reject an order for *user*
//! reasons — every system-failure path lives behind the injected
//! [`EventSink`], which treats infrastructure failure as fatal.

use crate::calc::{self, OrderId, Price, Quantity, UserId};
use crate::control::config::InstrumentConfig;
use crate::engine::book::OrderBook;
use crate::engine::error::EngineError;
use crate::engine::types::{ExecutionReport, Order, OrderKind, OrderStatus, Trade};
use crate::wal::event::{EventBody, EventPayload, EventSink, RejectCode};
use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// One executed fill, with the maker handle the settlement layer needs.
#[derive(Debug, Clone)]
pub struct Fill {
    /// The resting order that was hit.
    pub maker: Arc<Order>,
    /// Executed quantity.
    pub quantity: Quantity,
    /// Execution price (the maker's).
    pub price: Price,
}

/// Everything produced by processing one order.
#[derive(Debug)]
pub struct ProcessOutput {
    /// Caller-facing report.
    pub report: ExecutionReport,
    /// Fills with maker handles, in execution order.
    pub fills: Vec<Fill>,
    /// Makers cancelled by the self-trade policy.
    pub cancelled_makers: Vec<Arc<Order>>,
}

/// Result of a cancel request.
#[derive(Debug)]
pub struct CancelReport {
    /// The cancelled order.
    pub order: Arc<Order>,
    /// Quantity left unexecuted at cancellation.
    pub remaining: Quantity,
}

/// Per-instrument matching engine.
pub struct MatchingEngine {
    config: InstrumentConfig,
    book: Arc<OrderBook>,
    orders: DashMap<OrderId, Arc<Order>>,
    trade_sequence: AtomicU64,
    events: Arc<dyn EventSink>,
}

impl MatchingEngine {
    /// Create an engine over an empty book.
    #[must_use]
    pub fn new(config: InstrumentConfig, events: Arc<dyn EventSink>) -> Self {
        let book = Arc::new(OrderBook::new(config.instrument_id));
        Self {
            config,
            book,
            orders: DashMap::new(),
            trade_sequence: AtomicU64::new(0),
            events,
        }
    }

    /// The book this engine drives.
    #[inline]
    #[must_use]
    pub fn book(&self) -> &Arc<OrderBook> {
        &self.book
    }

    /// This engine's instrument configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Last trade sequence issued.
    #[inline]
    #[must_use]
    pub fn trade_sequence(&self) -> u64 {
        self.trade_sequence.load(Ordering::Acquire)
    }

    /// Restore the trade counter when seeding from a snapshot.
    pub fn set_trade_sequence(&self, sequence: u64) {
        self.trade_sequence.store(sequence, Ordering::Release);
    }

    /// Look up any order this engine has seen, live or terminal.
    #[must_use]
    pub fn get_order(&self, order_id: &OrderId) -> Option<Arc<Order>> {
        self.orders.get(order_id).map(|e| Arc::clone(e.value()))
    }

    /// Re-seat a resting order during snapshot restore or replay,
    /// bypassing validation and matching.
    ///
    /// # Errors
    /// Propagates [`EngineError::DuplicateOrderId`] from the book.
    pub fn restore_order(&self, order: Arc<Order>) -> Result<(), EngineError> {
        self.orders.insert(order.order_id, Arc::clone(&order));
        if order.kind.rests() && order.remaining() > 0 {
            self.book.insert(order)?;
        }
        Ok(())
    }

    /// Process one inbound order through validation, matching and
    /// post-match placement.
    ///
    /// The placement event is appended *before* matching: it is the
    /// durability commit point. Rejections emit `OrderRejected` and leave
    /// the book untouched.
    ///
    /// # Errors
    /// User-level rejections only; see [`EngineError`].
    pub fn process(&self, order: Arc<Order>) -> Result<ProcessOutput, EngineError> {
        counter!("engine_orders_received").increment(1);

        if let Err(err) = self.admit(&order) {
            self.reject(&order, &err);
            return Err(err);
        }

        // Commit point: the order is irreversibly in the system once this
        // record is durable.
        let placed_seq = self.events.publish(EventBody {
            instrument_id: self.config.instrument_id,
            payload: EventPayload::OrderPlaced {
                order_id: order.order_id,
                client_order_id: order.client_order_id,
                user_id: order.user_id,
                side: order.side,
                kind: order.kind,
                price: order.price,
                quantity: order.quantity,
                margin_basis: order.margin_basis,
                is_liquidation: order.is_liquidation,
            },
        });
        order.assign_sequence(placed_seq);
        order.set_timestamp_ns(calc::sequence_to_timestamp(placed_seq, 0));
        self.orders.insert(order.order_id, Arc::clone(&order));

        let mut trades: Vec<Trade> = Vec::new();
        let mut fills: Vec<Fill> = Vec::new();
        let taker_is_buy = order.side.is_buy();

        let outcome = self
            .book
            .match_against(&order, self.config.self_trade, |maker, qty, price| {
                let matched_seq = self.events.publish(EventBody {
                    instrument_id: self.config.instrument_id,
                    payload: EventPayload::OrderMatched {
                        taker_order_id: order.order_id,
                        maker_order_id: maker.order_id,
                        price,
                        quantity: qty,
                        taker_remaining: order.remaining(),
                        maker_remaining: maker.remaining(),
                    },
                });
                let trade_seq = self.trade_sequence.fetch_add(1, Ordering::AcqRel) + 1;
                let (buy_order_id, sell_order_id, buy_user_id, sell_user_id) = if taker_is_buy {
                    (order.order_id, maker.order_id, order.user_id, maker.user_id)
                } else {
                    (maker.order_id, order.order_id, maker.user_id, order.user_id)
                };
                let trade = Trade {
                    sequence_id: trade_seq,
                    buy_order_id,
                    sell_order_id,
                    buy_user_id,
                    sell_user_id,
                    instrument_id: self.config.instrument_id,
                    price,
                    quantity: qty,
                    is_taker_buy: taker_is_buy,
                    timestamp_ns: calc::sequence_to_timestamp(matched_seq, 0),
                };
                self.events.publish(EventBody {
                    instrument_id: self.config.instrument_id,
                    payload: EventPayload::TradeExecuted {
                        trade_sequence: trade_seq,
                        buy_order_id,
                        sell_order_id,
                        buy_user_id,
                        sell_user_id,
                        price,
                        quantity: qty,
                        is_taker_buy: taker_is_buy,
                    },
                });
                fills.push(Fill {
                    maker: Arc::clone(maker),
                    quantity: qty,
                    price,
                });
                trades.push(trade);
            });

        for maker in &outcome.cancelled_makers {
            self.events.publish(EventBody {
                instrument_id: self.config.instrument_id,
                payload: EventPayload::OrderCancelled {
                    order_id: maker.order_id,
                    user_id: maker.user_id,
                    remaining: maker.remaining(),
                },
            });
        }

        let remaining = order.remaining();
        if remaining > 0 {
            if order.kind.rests() && !order.is_liquidation {
                self.book.insert(Arc::clone(&order))?;
            } else {
                order.transition(OrderStatus::Cancelled);
                self.events.publish(EventBody {
                    instrument_id: self.config.instrument_id,
                    payload: EventPayload::OrderCancelled {
                        order_id: order.order_id,
                        user_id: order.user_id,
                        remaining,
                    },
                });
            }
        }

        counter!("engine_orders_processed").increment(1);
        counter!("engine_trades_executed").increment(trades.len() as u64);
        trace!(
            "engine {}: order {} -> {} ({} trades, {} remaining)",
            self.config.instrument_id,
            order.order_id,
            order.status(),
            trades.len(),
            remaining
        );

        Ok(ProcessOutput {
            report: ExecutionReport {
                order_id: order.order_id,
                client_order_id: order.client_order_id,
                status: order.status(),
                trades,
                remaining,
            },
            fills,
            cancelled_makers: outcome.cancelled_makers,
        })
    }

    /// Cancel a resting order.
    ///
    /// Cancelling a terminal order is a typed no-op: no mutation, no
    /// event.
    ///
    /// # Errors
    /// [`EngineError::OrderNotFound`], [`EngineError::WrongUser`] or
    /// [`EngineError::AlreadyTerminal`].
    pub fn cancel(&self, order_id: OrderId, user_id: UserId) -> Result<CancelReport, EngineError> {
        let order = self
            .get_order(&order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?;
        if order.user_id != user_id {
            return Err(EngineError::WrongUser {
                order_id,
                owner: order.user_id,
                requester: user_id,
            });
        }
        let status = order.status();
        if status.is_terminal() {
            return Err(EngineError::AlreadyTerminal { order_id, status });
        }

        self.book.remove(&order_id);
        let remaining = order.remaining();
        order.transition(OrderStatus::Cancelled);
        self.events.publish(EventBody {
            instrument_id: self.config.instrument_id,
            payload: EventPayload::OrderCancelled {
                order_id,
                user_id,
                remaining,
            },
        });
        counter!("engine_orders_cancelled").increment(1);
        Ok(CancelReport { order, remaining })
    }

    // ─── Admission ──────────────────────────────────────────────────────

    fn admit(&self, order: &Order) -> Result<(), EngineError> {
        self.validate(order)?;

        if order.kind == OrderKind::PostOnly
            && let Some(opposite) = self.best_opposite(order)
            && calc::can_match(order.price, opposite, order.side.is_buy())
        {
            return Err(EngineError::PostOnlyWouldCross {
                price: order.price,
                opposite_price: opposite,
            });
        }

        if order.kind == OrderKind::FillOrKill {
            let available = self
                .book
                .matchable_quantity(order.side, order.price, order.quantity);
            if available < order.quantity {
                return Err(EngineError::FokUnfillable {
                    requested: order.quantity,
                    available,
                });
            }
        }
        Ok(())
    }

    fn validate(&self, order: &Order) -> Result<(), EngineError> {
        let cfg = &self.config;
        if order.instrument_id != cfg.instrument_id {
            return Err(EngineError::UnknownInstrument(order.instrument_id));
        }
        if order.quantity <= 0 {
            return Err(EngineError::InvalidOrder {
                message: "quantity must be positive".to_string(),
            });
        }
        if order.quantity < cfg.min_quantity || order.quantity > cfg.max_quantity {
            return Err(EngineError::QuantityOutOfRange {
                quantity: order.quantity,
                min: cfg.min_quantity,
                max: cfg.max_quantity,
            });
        }
        if cfg.qty_step > 0 && order.quantity % cfg.qty_step != 0 {
            return Err(EngineError::InvalidStep {
                quantity: order.quantity,
                step: cfg.qty_step,
            });
        }

        // Liquidation takers run at market price regardless of kind.
        if order.kind.requires_price() && !order.is_liquidation {
            if order.price <= 0 {
                return Err(EngineError::InvalidOrder {
                    message: "price must be positive for limit-class orders".to_string(),
                });
            }
            if order.price < cfg.min_price || order.price > cfg.max_price {
                return Err(EngineError::PriceOutOfRange {
                    price: order.price,
                    min: cfg.min_price,
                    max: cfg.max_price,
                });
            }
            if cfg.tick_size > 0 && order.price % cfg.tick_size != 0 {
                return Err(EngineError::InvalidTick {
                    price: order.price,
                    tick_size: cfg.tick_size,
                });
            }
        } else if order.price != 0 {
            return Err(EngineError::InvalidOrder {
                message: "market orders carry no price".to_string(),
            });
        }
        Ok(())
    }

    fn best_opposite(&self, order: &Order) -> Option<Price> {
        match order.side {
            crate::engine::types::Side::Buy => self.book.best_ask(),
            crate::engine::types::Side::Sell => self.book.best_bid(),
        }
    }

    fn reject(&self, order: &Order, err: &EngineError) {
        counter!("engine_orders_rejected").increment(1);
        order.transition(OrderStatus::Rejected);
        self.events.publish(EventBody {
            instrument_id: self.config.instrument_id,
            payload: EventPayload::OrderRejected {
                order_id: order.order_id,
                user_id: order.user_id,
                reason: reject_code(err),
            },
        });
    }
}

/// Map an engine rejection to its wire reason.
#[must_use]
pub fn reject_code(err: &EngineError) -> RejectCode {
    match err {
        EngineError::PostOnlyWouldCross { .. } => RejectCode::PostOnlyWouldCross,
        EngineError::FokUnfillable { .. } => RejectCode::FokUnfillable,
        _ => RejectCode::InvalidOrder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Side;
    use crate::wal::event::{EventKind, MemorySink};
    use uuid::Uuid;

    fn engine() -> (MatchingEngine, Arc<MemorySink>) {
        let mut cfg = InstrumentConfig::with_defaults(1, "TEST-PERP");
        cfg.tick_size = 1;
        cfg.qty_step = 1;
        cfg.min_price = 1;
        cfg.min_quantity = 1;
        let sink = Arc::new(MemorySink::new());
        (MatchingEngine::new(cfg, Arc::clone(&sink) as _), sink)
    }

    fn order(id: OrderId, user: UserId, side: Side, kind: OrderKind, price: Price, qty: Quantity) -> Arc<Order> {
        Arc::new(Order::new(id, Uuid::new_v4(), user, 1, side, kind, price, qty))
    }

    #[test]
    fn test_exact_match_fills_both() {
        let (engine, sink) = engine();
        let sell = order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100);
        let buy = order(2, 2, Side::Buy, OrderKind::Limit, 50_000, 100);
        engine.process(Arc::clone(&sell)).unwrap();
        let out = engine.process(Arc::clone(&buy)).unwrap();

        assert_eq!(out.report.status, OrderStatus::Filled);
        assert_eq!(out.report.trades.len(), 1);
        let trade = &out.report.trades[0];
        assert_eq!(trade.price, 50_000);
        assert_eq!(trade.quantity, 100);
        assert!(trade.is_taker_buy);
        assert_eq!(trade.buy_user_id, 2);
        assert_eq!(trade.sell_user_id, 1);
        assert_eq!(sell.status(), OrderStatus::Filled);
        assert_eq!(engine.book().order_count(), 0);

        let kinds = sink.kinds();
        assert_eq!(
            kinds,
            vec![
                EventKind::OrderPlaced,
                EventKind::OrderPlaced,
                EventKind::OrderMatched,
                EventKind::TradeExecuted,
            ]
        );
    }

    #[test]
    fn test_event_sequence_exceeds_trade_sequence() {
        let (engine, sink) = engine();
        engine
            .process(order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100))
            .unwrap();
        let out = engine
            .process(order(2, 2, Side::Buy, OrderKind::Limit, 50_000, 100))
            .unwrap();
        let trade = &out.report.trades[0];
        let trade_event_seq = sink
            .events()
            .iter()
            .find(|e| e.kind() == EventKind::TradeExecuted)
            .map(|e| e.sequence)
            .unwrap();
        assert!(trade_event_seq >= trade.sequence_id);
    }

    #[test]
    fn test_price_time_priority_better_price_first() {
        let (engine, _) = engine();
        engine
            .process(order(1, 1, Side::Sell, OrderKind::Limit, 49_900, 100))
            .unwrap();
        engine
            .process(order(2, 2, Side::Sell, OrderKind::Limit, 50_000, 100))
            .unwrap();
        let out = engine
            .process(order(3, 3, Side::Buy, OrderKind::Limit, 50_100, 100))
            .unwrap();
        assert_eq!(out.report.trades.len(), 1);
        assert_eq!(out.report.trades[0].price, 49_900);
        // The worse-priced sell still rests.
        assert_eq!(engine.book().best_ask(), Some(50_000));
        assert_eq!(
            engine.get_order(&2).unwrap().status(),
            OrderStatus::Pending
        );
    }

    #[test]
    fn test_partial_fill_rests_remainder() {
        let (engine, _) = engine();
        let sell = order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 1_000);
        engine.process(Arc::clone(&sell)).unwrap();
        let out = engine
            .process(order(2, 2, Side::Buy, OrderKind::Limit, 50_000, 300))
            .unwrap();
        assert_eq!(out.report.status, OrderStatus::Filled);
        assert_eq!(sell.status(), OrderStatus::PartialFilled);
        assert_eq!(sell.remaining(), 700);
        assert_eq!(engine.book().best_ask(), Some(50_000));
    }

    #[test]
    fn test_market_order_exhausts_side_then_cancels() {
        let (engine, sink) = engine();
        engine
            .process(order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100))
            .unwrap();
        engine
            .process(order(2, 1, Side::Sell, OrderKind::Limit, 50_010, 100))
            .unwrap();
        let out = engine
            .process(order(3, 2, Side::Buy, OrderKind::Market, 0, 300))
            .unwrap();
        assert_eq!(out.report.trades.len(), 2);
        assert_eq!(out.report.trades[0].price, 50_000);
        assert_eq!(out.report.trades[1].price, 50_010);
        assert_eq!(out.report.status, OrderStatus::Cancelled);
        assert_eq!(out.report.remaining, 100);
        assert!(sink.kinds().contains(&EventKind::OrderCancelled));
    }

    #[test]
    fn test_market_order_empty_book_cancelled_no_trades() {
        let (engine, sink) = engine();
        let out = engine
            .process(order(1, 1, Side::Buy, OrderKind::Market, 0, 100))
            .unwrap();
        assert_eq!(out.report.status, OrderStatus::Cancelled);
        assert_eq!(out.report.remaining, 100);
        assert!(out.report.trades.is_empty());
        let kinds = sink.kinds();
        assert_eq!(
            kinds,
            vec![EventKind::OrderPlaced, EventKind::OrderCancelled]
        );
    }

    #[test]
    fn test_ioc_cancels_remainder() {
        let (engine, _) = engine();
        engine
            .process(order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100))
            .unwrap();
        let out = engine
            .process(order(2, 2, Side::Buy, OrderKind::ImmediateOrCancel, 50_000, 300))
            .unwrap();
        assert_eq!(out.report.trades.len(), 1);
        assert_eq!(out.report.status, OrderStatus::Cancelled);
        assert_eq!(out.report.remaining, 200);
        assert_eq!(engine.book().order_count(), 0);
    }

    #[test]
    fn test_fok_unfillable_rejected_without_mutation() {
        let (engine, sink) = engine();
        engine
            .process(order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100))
            .unwrap();
        let before = engine.book().depth(10);
        let err = engine
            .process(order(2, 2, Side::Buy, OrderKind::FillOrKill, 50_000, 300))
            .unwrap_err();
        assert!(matches!(err, EngineError::FokUnfillable { available: 100, .. }));
        let after = engine.book().depth(10);
        assert_eq!(before.asks, after.asks);
        // Rejection is evented, but no placement.
        let kinds = sink.kinds();
        assert_eq!(kinds.last(), Some(&EventKind::OrderRejected));
        assert!(!kinds.iter().any(|k| *k == EventKind::OrderMatched));
    }

    #[test]
    fn test_fok_fillable_executes_fully() {
        let (engine, _) = engine();
        engine
            .process(order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100))
            .unwrap();
        engine
            .process(order(2, 1, Side::Sell, OrderKind::Limit, 50_010, 200))
            .unwrap();
        let out = engine
            .process(order(3, 2, Side::Buy, OrderKind::FillOrKill, 50_010, 300))
            .unwrap();
        assert_eq!(out.report.status, OrderStatus::Filled);
        assert_eq!(out.report.trades.len(), 2);
    }

    #[test]
    fn test_post_only_would_cross_rejected() {
        let (engine, _) = engine();
        engine
            .process(order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100))
            .unwrap();
        let err = engine
            .process(order(2, 2, Side::Buy, OrderKind::PostOnly, 50_000, 100))
            .unwrap_err();
        assert!(matches!(err, EngineError::PostOnlyWouldCross { .. }));
        assert_eq!(engine.book().order_count(), 1);
    }

    #[test]
    fn test_post_only_rests_when_not_crossing() {
        let (engine, _) = engine();
        engine
            .process(order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100))
            .unwrap();
        let out = engine
            .process(order(2, 2, Side::Buy, OrderKind::PostOnly, 49_990, 100))
            .unwrap();
        assert_eq!(out.report.status, OrderStatus::Pending);
        assert_eq!(engine.book().best_bid(), Some(49_990));
    }

    #[test]
    fn test_tick_and_step_boundaries() {
        let mut cfg = InstrumentConfig::with_defaults(1, "T");
        cfg.tick_size = 10;
        cfg.qty_step = 5;
        cfg.min_price = 10;
        cfg.min_quantity = 5;
        let engine = MatchingEngine::new(cfg, Arc::new(MemorySink::new()) as _);

        // Exactly on tick: accepted.
        assert!(
            engine
                .process(order(1, 1, Side::Buy, OrderKind::Limit, 100, 10))
                .is_ok()
        );
        // One off tick: rejected.
        let err = engine
            .process(order(2, 1, Side::Buy, OrderKind::Limit, 101, 10))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTick { .. }));
        // Off step: rejected.
        let err = engine
            .process(order(3, 1, Side::Buy, OrderKind::Limit, 100, 12))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStep { .. }));
    }

    #[test]
    fn test_quantity_range_boundaries() {
        let mut cfg = InstrumentConfig::with_defaults(1, "T");
        cfg.tick_size = 1;
        cfg.qty_step = 1;
        cfg.min_price = 1;
        cfg.min_quantity = 10;
        cfg.max_quantity = 100;
        let engine = MatchingEngine::new(cfg, Arc::new(MemorySink::new()) as _);
        // Exactly at min and max: accepted.
        assert!(
            engine
                .process(order(1, 1, Side::Buy, OrderKind::Limit, 100, 10))
                .is_ok()
        );
        assert!(
            engine
                .process(order(2, 1, Side::Buy, OrderKind::Limit, 100, 100))
                .is_ok()
        );
        // Strictly outside: rejected.
        assert!(
            engine
                .process(order(3, 1, Side::Buy, OrderKind::Limit, 100, 9))
                .is_err()
        );
        assert!(
            engine
                .process(order(4, 1, Side::Buy, OrderKind::Limit, 100, 101))
                .is_err()
        );
    }

    #[test]
    fn test_cancel_is_idempotent_no_second_event() {
        let (engine, sink) = engine();
        engine
            .process(order(1, 1, Side::Buy, OrderKind::Limit, 50_000, 100))
            .unwrap();
        engine.cancel(1, 1).unwrap();
        let events_after_first = sink.events().len();
        let err = engine.cancel(1, 1).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminal { .. }));
        assert_eq!(sink.events().len(), events_after_first);
        assert_eq!(engine.book().order_count(), 0);
    }

    #[test]
    fn test_cancel_wrong_user() {
        let (engine, _) = engine();
        engine
            .process(order(1, 1, Side::Buy, OrderKind::Limit, 50_000, 100))
            .unwrap();
        let err = engine.cancel(1, 2).unwrap_err();
        assert!(matches!(err, EngineError::WrongUser { owner: 1, .. }));
        assert_eq!(engine.book().order_count(), 1);
    }

    #[test]
    fn test_cancel_unknown_order() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.cancel(99, 1).unwrap_err(),
            EngineError::OrderNotFound(99)
        ));
    }

    #[test]
    fn test_cancel_partial_fill_reports_remaining() {
        let (engine, sink) = engine();
        engine
            .process(order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100))
            .unwrap();
        engine
            .process(order(2, 2, Side::Buy, OrderKind::Limit, 50_000, 30))
            .unwrap();
        let report = engine.cancel(1, 1).unwrap();
        assert_eq!(report.remaining, 70);
        let last = sink.events().last().cloned().unwrap();
        match last.payload {
            EventPayload::OrderCancelled { remaining, .. } => assert_eq!(remaining, 70),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_fill_conservation() {
        let (engine, _) = engine();
        let sell = order(1, 1, Side::Sell, OrderKind::Limit, 50_000, 100);
        let buy = order(2, 2, Side::Buy, OrderKind::Limit, 50_000, 60);
        engine.process(Arc::clone(&sell)).unwrap();
        let out = engine.process(Arc::clone(&buy)).unwrap();
        let qty = out.report.trades[0].quantity;
        assert_eq!(sell.filled() + buy.filled(), 2 * qty);
    }

    #[test]
    fn test_self_trade_cancel_policy_emits_cancel() {
        let mut cfg = InstrumentConfig::with_defaults(1, "T");
        cfg.tick_size = 1;
        cfg.qty_step = 1;
        cfg.min_price = 1;
        cfg.min_quantity = 1;
        cfg.self_trade = crate::engine::types::SelfTradePolicy::CancelResting;
        let sink = Arc::new(MemorySink::new());
        let engine = MatchingEngine::new(cfg, Arc::clone(&sink) as _);
        engine
            .process(order(1, 7, Side::Sell, OrderKind::Limit, 100, 10))
            .unwrap();
        let out = engine
            .process(order(2, 7, Side::Buy, OrderKind::Limit, 100, 10))
            .unwrap();
        assert!(out.report.trades.is_empty());
        assert_eq!(out.cancelled_makers.len(), 1);
        // Taker found no counterparty and rests.
        assert_eq!(out.report.status, OrderStatus::Pending);
        assert!(sink.kinds().contains(&EventKind::OrderCancelled));
    }
}
