//! Event-by-event state reconstruction for recovery.
//!
//! The rebuilder applies each logged event to the same ledger, position
//! and book structures the live path mutates. Margin freezes and moves
//! are recomputed from placement data through the deterministic calc
//! layer; balance deltas (realized PnL, funding, deposits) are applied
//! from their recorded events through the same insurance-backed
//! settlement rule the live path uses. A cold replay therefore
//! reproduces ledger, positions and books byte-for-byte.

use crate::calc::{self, InstrumentId, OrderId};
use crate::control::CoreError;
use crate::engine::MatchingEngine;
use crate::engine::types::{Order, OrderStatus};
use crate::ledger::AccountLedger;
use crate::ledger::position::PositionBook;
use crate::wal::event::{Event, EventPayload};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Applies logged events to fresh (or snapshot-seeded) state.
pub struct StateRebuilder {
    ledger: Arc<AccountLedger>,
    positions: Arc<PositionBook>,
    engines: HashMap<InstrumentId, Arc<MatchingEngine>>,
    orders: HashMap<OrderId, Arc<Order>>,
    max_order_id: OrderId,
    trade_sequences: HashMap<InstrumentId, u64>,
    applied: u64,
}

impl StateRebuilder {
    /// Create a rebuilder over snapshot-seeded state. Orders already
    /// resting in the seeded books are adopted as live.
    #[must_use]
    pub fn new(
        ledger: Arc<AccountLedger>,
        positions: Arc<PositionBook>,
        engines: HashMap<InstrumentId, Arc<MatchingEngine>>,
        next_order_id_seed: OrderId,
    ) -> Self {
        let mut orders = HashMap::new();
        let mut max_order_id = next_order_id_seed.saturating_sub(1);
        for engine in engines.values() {
            for order in engine.book().resting_orders() {
                max_order_id = max_order_id.max(order.order_id);
                orders.insert(order.order_id, order);
            }
        }
        Self {
            ledger,
            positions,
            engines,
            orders,
            max_order_id,
            trade_sequences: HashMap::new(),
            applied: 0,
        }
    }

    /// Number of events applied so far.
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Apply one event.
    ///
    /// # Errors
    /// [`CoreError::ReplayInvariant`] when the log contradicts the
    /// reconstructed state (fatal: exit code 4).
    pub fn apply(&mut self, event: &Event) -> Result<(), CoreError> {
        self.applied += 1;
        match &event.payload {
            EventPayload::OrderPlaced {
                order_id,
                client_order_id,
                user_id,
                side,
                kind,
                price,
                quantity,
                margin_basis,
                is_liquidation,
            } => {
                let engine = Arc::clone(self.engine(event.instrument_id)?);
                let leverage = engine.config().leverage_bps;
                let mut order = Order::new(
                    *order_id,
                    *client_order_id,
                    *user_id,
                    event.instrument_id,
                    *side,
                    *kind,
                    *price,
                    *quantity,
                );
                order.margin_basis = *margin_basis;
                order.is_liquidation = *is_liquidation;
                let order = Arc::new(order);
                order.assign_sequence(event.sequence);
                order.set_timestamp_ns(event.timestamp_ns);

                if !is_liquidation {
                    let required = calc::required_margin(*margin_basis, *quantity, leverage)?;
                    if required > 0 && !self.ledger.freeze(*user_id, required) {
                        return Err(CoreError::ReplayInvariant(format!(
                            "cannot re-freeze {required} for order {order_id} at sequence {}",
                            event.sequence
                        )));
                    }
                }
                self.max_order_id = self.max_order_id.max(*order_id);
                self.orders.insert(*order_id, Arc::clone(&order));
                engine.restore_order(order).map_err(|e| {
                    CoreError::ReplayInvariant(format!(
                        "cannot restore order {order_id} at sequence {}: {e}",
                        event.sequence
                    ))
                })?;
            }

            EventPayload::OrderMatched {
                taker_order_id,
                maker_order_id,
                price,
                quantity,
                ..
            } => {
                let engine = self.engine(event.instrument_id)?;
                let leverage = engine.config().leverage_bps;
                let taker = self.order(*taker_order_id, event)?;
                let maker = self.order(*maker_order_id, event)?;

                engine.book().reduce(maker_order_id, *quantity).map_err(|e| {
                    CoreError::ReplayInvariant(format!(
                        "maker {maker_order_id} not reducible at sequence {}: {e}",
                        event.sequence
                    ))
                })?;
                if engine.book().contains(taker_order_id) {
                    engine.book().reduce(taker_order_id, *quantity).map_err(|e| {
                        CoreError::ReplayInvariant(format!(
                            "taker {taker_order_id} not reducible at sequence {}: {e}",
                            event.sequence
                        ))
                    })?;
                } else {
                    taker.record_fill(*quantity);
                }

                // Margin and position bookkeeping, ascending user id —
                // the same rule the live settlement applies. Realized
                // PnL is applied from BalanceUpdated records, not here.
                let mut parties = [&taker, &maker];
                parties.sort_by_key(|o| o.user_id);
                for order in parties {
                    let outcome = self.positions.apply_fill(
                        order.user_id,
                        event.instrument_id,
                        *quantity,
                        order.side,
                        *price,
                    );
                    if !order.is_liquidation {
                        let increase = *quantity - outcome.reduced;
                        if increase > 0 {
                            let moved =
                                calc::required_margin(order.margin_basis, increase, leverage)?;
                            self.ledger.fill_margin(order.user_id, moved);
                        }
                        if outcome.reduced > 0 {
                            let thawed = calc::required_margin(
                                order.margin_basis,
                                outcome.reduced,
                                leverage,
                            )?;
                            self.ledger.unfreeze(order.user_id, thawed);
                        }
                    }
                    if outcome.reduced > 0 {
                        let released = calc::required_margin(
                            outcome.entry_before,
                            outcome.reduced,
                            leverage,
                        )?;
                        self.ledger.release_margin(order.user_id, released);
                    }
                }
            }

            EventPayload::OrderCancelled {
                order_id,
                user_id,
                remaining,
            } => {
                let engine = self.engine(event.instrument_id)?;
                let leverage = engine.config().leverage_bps;
                let order = self.order(*order_id, event)?;
                engine.book().remove(order_id);
                order.transition(OrderStatus::Cancelled);
                if !order.is_liquidation {
                    let unfrozen = calc::required_margin(order.margin_basis, *remaining, leverage)?;
                    self.ledger.unfreeze(*user_id, unfrozen);
                }
            }

            EventPayload::OrderRejected { order_id, .. } => {
                // Rejections never mutated state, but their ids were
                // consumed; keep the id counter ahead of them.
                self.max_order_id = self.max_order_id.max(*order_id);
            }

            EventPayload::Liquidated { .. } => {
                // Audit-only: the liquidation's trades and balance
                // effects have their own events.
            }

            EventPayload::TradeExecuted { trade_sequence, .. } => {
                let entry = self
                    .trade_sequences
                    .entry(event.instrument_id)
                    .or_insert(0);
                *entry = (*entry).max(*trade_sequence);
            }

            EventPayload::FundingSettled {
                user_id, payment, ..
            } => {
                self.ledger.settle_with_insurance(*user_id, -payment);
            }

            EventPayload::BalanceUpdated {
                user_id,
                delta,
                balance_after,
                ..
            } => {
                self.ledger.settle_with_insurance(*user_id, *delta);
                let actual = self.ledger.balance(*user_id);
                if actual != *balance_after {
                    return Err(CoreError::ReplayInvariant(format!(
                        "balance divergence for user {user_id} at sequence {}: \
                         recorded {balance_after}, reconstructed {actual}",
                        event.sequence
                    )));
                }
            }
        }
        Ok(())
    }

    /// Finish: restore trade counters and return the next order id.
    #[must_use]
    pub fn finish(self) -> OrderId {
        for (instrument_id, trade_sequence) in &self.trade_sequences {
            if let Some(engine) = self.engines.get(instrument_id) {
                engine.set_trade_sequence(engine.trade_sequence().max(*trade_sequence));
            }
        }
        debug!("replay: applied {} events", self.applied);
        self.max_order_id + 1
    }

    fn engine(&self, instrument_id: InstrumentId) -> Result<&Arc<MatchingEngine>, CoreError> {
        self.engines
            .get(&instrument_id)
            .ok_or(CoreError::UnknownInstrument(instrument_id))
    }

    fn order(&self, order_id: OrderId, event: &Event) -> Result<Arc<Order>, CoreError> {
        self.orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::ReplayInvariant(format!(
                    "unknown order {order_id} referenced at sequence {}",
                    event.sequence
                ))
            })
    }
}
