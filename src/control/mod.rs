//! The admission controller: validates, rate-limits and margins inbound
//! orders, hands them to per-instrument matching threads, settles the
//! results and serves queries.
//!
//! Pipeline per inbound order:
//!
//! ```text
//! validate -> rate-limit -> position-limit check -> margin freeze
//!     -> WAL append (ORDER_PLACED) -> match -> WAL append (TRADE/STATUS)
//!     -> ledger & position updates -> reply
//! ```
//!
//! Failure at any step before the WAL append rolls back the margin
//! freeze and emits no events. Once the placement record is appended the
//! order is irreversibly in the system.

pub mod config;
mod rate_limit;
mod replay;

pub use rate_limit::RateLimiter;
pub use replay::StateRebuilder;

use crate::calc::{self, CalcError, InstrumentId, OrderId, Price, Quantity, UserId};
use crate::control::config::{CoreConfig, InstrumentConfig};
use crate::engine::types::{ExecutionReport, Order, OrderKind, OrderStatus, Side};
use crate::engine::{EngineError, MatchingEngine, ProcessOutput};
use crate::ledger::position::{PositionBook, PositionLimitViolation};
use crate::ledger::{AccountLedger, AccountStats, INSURANCE_FUND_ACCOUNT};
use crate::risk::{FundingConfig, FundingScheduler, FundingSettlement, LiquidationEvaluator, RiskAssessment};
use crate::wal::event::{BalanceReason, EventBody, EventPayload, EventSink};
use crate::wal::snapshot::{
    BookDump, RestingOrderDump, SnapshotSections, StateDump, list_snapshots, load_snapshot,
    snapshot_path, write_snapshot,
};
use crate::wal::{EventLog, WalConfig, WalError, WalSink};
use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use metrics::counter;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Top-level error surface of the core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The order failed structural validation.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Available balance below the required margin.
    #[error("insufficient margin: required {required}, available {available}")]
    InsufficientMargin {
        /// Margin the order needs.
        required: i64,
        /// The user's available balance.
        available: i64,
    },

    /// The would-be net position exceeds its limit.
    #[error("position limit exceeded: would-be net {would_be_net} over limit {limit}")]
    PositionLimit {
        /// The net size the order could produce.
        would_be_net: Quantity,
        /// The configured limit.
        limit: Quantity,
    },

    /// Unknown order.
    #[error("no order with id {0} on this instance")]
    NotFound(OrderId),

    /// The order belongs to someone else.
    #[error("order {order_id} belongs to another user")]
    WrongUser {
        /// The order in question.
        order_id: OrderId,
    },

    /// The order already reached a terminal status (typed no-op).
    #[error("order {order_id} already terminal ({status})")]
    AlreadyTerminal {
        /// The order in question.
        order_id: OrderId,
        /// Its terminal status.
        status: OrderStatus,
    },

    /// Admission rate limit hit.
    #[error("rate limited")]
    RateLimited,

    /// A post-only order would have crossed.
    #[error("post-only would cross opposite best {opposite_price}")]
    PostOnlyWouldCross {
        /// The best opposite price.
        opposite_price: Price,
    },

    /// A fill-or-kill order cannot be fully satisfied.
    #[error("fill-or-kill unfillable: {available} available")]
    FokUnfillable {
        /// Matchable quantity available.
        available: Quantity,
    },

    /// Back-pressure: a bounded queue is full. Retryable.
    #[error("queue full")]
    QueueFull,

    /// The core is shutting down. Retryable against a new instance.
    #[error("shutting down")]
    Shutdown,

    /// The instrument is not served by this instance.
    #[error("unknown instrument {0}")]
    UnknownInstrument(InstrumentId),

    /// Balance operation exceeds the available funds.
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Amount requested.
        requested: i64,
        /// Amount available.
        available: i64,
    },

    /// Configuration failure (exit code 2).
    #[error("config error: {0}")]
    Config(String),

    /// Fixed-point overflow outside the permitted saturation point.
    /// Determinism violation; fatal.
    #[error("fixed-point overflow")]
    Overflow,

    /// Replay contradicted the reconstructed state (exit code 4).
    #[error("replay invariant violation: {0}")]
    ReplayInvariant(String),

    /// Event-log failure.
    #[error(transparent)]
    Wal(#[from] WalError),
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::OrderNotFound(id) => CoreError::NotFound(id),
            EngineError::WrongUser { order_id, .. } => CoreError::WrongUser { order_id },
            EngineError::AlreadyTerminal { order_id, status } => {
                CoreError::AlreadyTerminal { order_id, status }
            }
            EngineError::PostOnlyWouldCross { opposite_price, .. } => {
                CoreError::PostOnlyWouldCross { opposite_price }
            }
            EngineError::FokUnfillable { available, .. } => CoreError::FokUnfillable { available },
            EngineError::UnknownInstrument(id) => CoreError::UnknownInstrument(id),
            other => CoreError::InvalidOrder(other.to_string()),
        }
    }
}

impl From<CalcError> for CoreError {
    fn from(_: CalcError) -> Self {
        CoreError::Overflow
    }
}

impl From<PositionLimitViolation> for CoreError {
    fn from(err: PositionLimitViolation) -> Self {
        CoreError::PositionLimit {
            would_be_net: err.would_be_net,
            limit: err.limit,
        }
    }
}

impl CoreError {
    /// Exit code for the CLI harness.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Config(_) => 2,
            CoreError::Wal(WalError::CorruptBelowCommitted { .. }) => 3,
            CoreError::ReplayInvariant(_) | CoreError::Wal(WalError::SequenceGap { .. }) => 4,
            CoreError::Wal(_) => 5,
            _ => 1,
        }
    }
}

/// An inbound order submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// The submitting user.
    pub user_id: UserId,
    /// Target instrument.
    pub instrument_id: InstrumentId,
    /// Buy or sell.
    pub side: Side,
    /// Execution policy.
    pub kind: OrderKind,
    /// Scaled limit price; zero for market orders.
    pub price: Price,
    /// Scaled quantity.
    pub quantity: Quantity,
    /// Caller idempotency id; generated when absent.
    pub client_order_id: Option<Uuid>,
}

/// Acknowledgement of a cancel request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CancelAck {
    /// The cancelled order.
    pub order_id: OrderId,
    /// Quantity left unexecuted.
    pub remaining: Quantity,
}

/// One position as reported to callers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PositionView {
    /// Signed net size.
    pub net_size: Quantity,
    /// Average entry price.
    pub entry_price: Price,
    /// Current mark (zero when unset).
    pub mark_price: Price,
    /// Unrealized PnL against the mark (zero when no mark).
    pub unrealized_pnl: i64,
    /// Estimated price at which the position hits maintenance margin
    /// (zero when flat).
    pub liquidation_price: Price,
}

/// Outcome of one forced liquidation.
#[derive(Debug)]
pub struct LiquidationOutcome {
    /// The risk picture that triggered it.
    pub assessment: RiskAssessment,
    /// The execution of the reducing order.
    pub report: ExecutionReport,
    /// Amount drawn from the insurance fund.
    pub insurance_draw: i64,
}

enum Command {
    Submit {
        order: Arc<Order>,
        reply: Sender<Result<ExecutionReport, CoreError>>,
    },
    Cancel {
        order_id: OrderId,
        user_id: UserId,
        reply: Sender<Result<CancelAck, CoreError>>,
    },
    Halt,
}

struct InstrumentHandle {
    config: InstrumentConfig,
    engine: Arc<MatchingEngine>,
    tx: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    mark_price: Arc<AtomicI64>,
}

/// The core's public face: admission, cancellation, queries and the
/// periodic risk entry points.
pub struct Controller {
    config: CoreConfig,
    wal: Arc<EventLog>,
    sink: Arc<dyn EventSink>,
    ledger: Arc<AccountLedger>,
    positions: Arc<PositionBook>,
    funding: Arc<FundingScheduler>,
    evaluator: LiquidationEvaluator,
    instruments: HashMap<InstrumentId, InstrumentHandle>,
    limiter: RateLimiter,
    next_order_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl Controller {
    /// Open a core instance: recover the event log, seed state from the
    /// latest snapshot, replay the tail and start one matching thread
    /// per instrument.
    ///
    /// # Errors
    /// Configuration, recovery and replay failures; see
    /// [`CoreError::exit_code`] for the harness mapping.
    pub fn open(config: CoreConfig) -> Result<Self, CoreError> {
        if config.instruments.is_empty() {
            return Err(CoreError::Config("no instruments configured".to_string()));
        }

        let wal = Arc::new(EventLog::open(WalConfig::from_settings(
            &config.data_dir,
            &config.wal,
        ))?);
        let sink: Arc<dyn EventSink> = Arc::new(WalSink::new(Arc::clone(&wal)));

        let ledger = Arc::new(AccountLedger::new());
        let positions = Arc::new(PositionBook::new());
        let funding = Arc::new(FundingScheduler::new(
            FundingConfig::from_settings(&config.funding),
            Arc::clone(&ledger),
            Arc::clone(&positions),
        ));

        // Seed from the newest snapshot, if any.
        let mut snapshot_seq = 0u64;
        let mut next_order_seed = 1u64;
        let mut book_dumps: HashMap<InstrumentId, BookDump> = HashMap::new();
        if let Some(latest) = list_snapshots(&config.data_dir)?.last().copied() {
            let (dump, sections) = load_snapshot(&snapshot_path(&config.data_dir, latest))?;
            if !sections.contains(SnapshotSections::full()) {
                return Err(CoreError::Wal(WalError::SnapshotInvalid {
                    message: "recovery snapshot is missing sections".to_string(),
                }));
            }
            ledger.restore(&dump.accounts);
            positions.restore(&dump.positions);
            funding.restore(&dump.funding);
            snapshot_seq = dump.sequence;
            next_order_seed = dump.next_order_id.max(1);
            for book in dump.books {
                book_dumps.insert(book.instrument_id, book);
            }
            info!("controller: seeded from snapshot at sequence {snapshot_seq}");
        }

        let mut engines: HashMap<InstrumentId, Arc<MatchingEngine>> = HashMap::new();
        for instrument in &config.instruments {
            let engine = Arc::new(MatchingEngine::new(instrument.clone(), Arc::clone(&sink)));
            if let Some(book) = book_dumps.remove(&instrument.instrument_id) {
                engine.book().restore_last_trade(book.last_trade_price);
                engine.set_trade_sequence(book.trade_sequence);
                for row in &book.orders {
                    engine
                        .restore_order(row.to_order(instrument.instrument_id))
                        .map_err(|e| {
                            CoreError::ReplayInvariant(format!(
                                "snapshot order {} not restorable: {e}",
                                row.order_id
                            ))
                        })?;
                }
            }
            engines.insert(instrument.instrument_id, engine);
        }

        // Replay the tail beyond the snapshot.
        let latest = wal.latest_sequence();
        let mut rebuilder = StateRebuilder::new(
            Arc::clone(&ledger),
            Arc::clone(&positions),
            engines.clone(),
            next_order_seed,
        );
        if latest > snapshot_seq {
            let mut expected = snapshot_seq + 1;
            for item in wal.range(snapshot_seq + 1, latest)? {
                let event = item?;
                if event.sequence != expected {
                    return Err(CoreError::Wal(WalError::SequenceGap {
                        expected,
                        actual: event.sequence,
                    }));
                }
                expected += 1;
                rebuilder.apply(&event)?;
            }
            info!(
                "controller: replayed {} events ({} -> {latest})",
                rebuilder.applied(),
                snapshot_seq + 1
            );
        }
        let next_order_id = rebuilder.finish();

        // Anchor funding schedules that have never settled.
        let now_ns = crate::utils::current_time_nanos();
        for instrument in &config.instruments {
            funding.anchor(instrument.instrument_id, now_ns);
        }

        let limiter = RateLimiter::new(&config.rate_limit);
        let evaluator =
            LiquidationEvaluator::new(Arc::clone(&ledger), Arc::clone(&positions));

        let mut instruments = HashMap::new();
        for instrument in &config.instruments {
            let engine = Arc::clone(&engines[&instrument.instrument_id]);
            let (tx, rx) = bounded::<Command>(config.command_queue_depth.max(1));
            let mark_price = Arc::new(AtomicI64::new(0));
            let worker = InstrumentWorker {
                instrument_id: instrument.instrument_id,
                leverage_bps: instrument.leverage_bps,
                engine: Arc::clone(&engine),
                ledger: Arc::clone(&ledger),
                positions: Arc::clone(&positions),
                sink: Arc::clone(&sink),
            };
            let symbol = instrument.symbol.clone();
            let handle = std::thread::Builder::new()
                .name(format!("match-{symbol}"))
                .spawn(move || worker.run(rx))
                .map_err(|e| CoreError::Config(format!("cannot spawn matching thread: {e}")))?;
            instruments.insert(
                instrument.instrument_id,
                InstrumentHandle {
                    config: instrument.clone(),
                    engine,
                    tx,
                    worker: Mutex::new(Some(handle)),
                    mark_price,
                },
            );
        }

        info!(
            "controller: serving {} instrument(s), next order id {next_order_id}",
            instruments.len()
        );
        Ok(Self {
            config,
            wal,
            sink,
            ledger,
            positions,
            funding,
            evaluator,
            instruments,
            limiter,
            next_order_id: AtomicU64::new(next_order_id),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Submit one order through the full admission pipeline.
    ///
    /// # Errors
    /// Every user-rejection and back-pressure variant of [`CoreError`].
    pub fn submit_order(&self, request: SubmitRequest) -> Result<ExecutionReport, CoreError> {
        counter!("controller_orders_submitted").increment(1);
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CoreError::Shutdown);
        }
        let handle = self.handle(request.instrument_id)?;

        if !self.limiter.allow(request.user_id) {
            counter!("controller_orders_rate_limited").increment(1);
            return Err(CoreError::RateLimited);
        }
        if self.wal.is_backlogged() {
            return Err(CoreError::QueueFull);
        }

        // Advisory position check before any money moves. The
        // instrument's default limit applies to holders without an
        // explicit one.
        self.positions.check(
            request.user_id,
            request.instrument_id,
            request.quantity,
            request.side,
            handle.config.default_position_limit,
        )?;

        // Margin freeze: tentative until the placement record is durable.
        let basis = self.margin_basis(handle, &request)?;
        let required = calc::required_margin(basis, request.quantity, handle.config.leverage_bps)?;
        if required > 0 && !self.ledger.freeze(request.user_id, required) {
            return Err(CoreError::InsufficientMargin {
                required,
                available: self.ledger.available(request.user_id),
            });
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::AcqRel);
        let mut order = Order::new(
            order_id,
            request.client_order_id.unwrap_or_else(Uuid::new_v4),
            request.user_id,
            request.instrument_id,
            request.side,
            request.kind,
            request.price,
            request.quantity,
        );
        order.margin_basis = basis;
        let order = Arc::new(order);

        match self.dispatch_submit(handle, Arc::clone(&order)) {
            Ok(report) => Ok(report),
            Err(err) => {
                if matches!(err, CoreError::QueueFull | CoreError::Shutdown) {
                    // The order never reached the matching thread; the
                    // freeze rolls back here.
                    self.ledger.unfreeze(request.user_id, required);
                }
                Err(err)
            }
        }
    }

    /// Cancel an order.
    ///
    /// # Errors
    /// [`CoreError::NotFound`], [`CoreError::WrongUser`],
    /// [`CoreError::AlreadyTerminal`] (all typed no-ops) or
    /// back-pressure variants.
    pub fn cancel_order(&self, order_id: OrderId, user_id: UserId) -> Result<CancelAck, CoreError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(CoreError::Shutdown);
        }
        let handle = self
            .instruments
            .values()
            .find(|h| h.engine.get_order(&order_id).is_some())
            .ok_or(CoreError::NotFound(order_id))?;

        let (reply_tx, reply_rx) = bounded(1);
        self.send(handle, Command::Cancel {
            order_id,
            user_id,
            reply: reply_tx,
        })?;
        reply_rx.recv().map_err(|_| CoreError::Shutdown)?
    }

    /// Aggregated book depth for one instrument.
    ///
    /// # Errors
    /// [`CoreError::UnknownInstrument`].
    pub fn query_book(
        &self,
        instrument_id: InstrumentId,
        depth: usize,
    ) -> Result<crate::engine::types::DepthSnapshot, CoreError> {
        Ok(self.handle(instrument_id)?.engine.book().depth(depth))
    }

    /// Balances for one user.
    #[must_use]
    pub fn query_account(&self, user_id: UserId) -> AccountStats {
        self.ledger.snapshot(user_id)
    }

    /// Position, entry, mark and unrealized PnL for one holder.
    ///
    /// # Errors
    /// [`CoreError::UnknownInstrument`] or [`CoreError::Overflow`].
    pub fn query_position(
        &self,
        user_id: UserId,
        instrument_id: InstrumentId,
    ) -> Result<PositionView, CoreError> {
        let handle = self.handle(instrument_id)?;
        let position = self.positions.get(user_id, instrument_id);
        let mark_price = handle.mark_price.load(Ordering::Acquire);
        let unrealized_pnl = if mark_price != 0 && position.net_size != 0 {
            calc::pnl(
                position.entry_price,
                mark_price,
                position.net_size.abs(),
                position.net_size > 0,
            )?
        } else {
            0
        };
        let liquidation_price = if position.net_size != 0 {
            calc::liquidation_price(
                position.entry_price,
                position.net_size > 0,
                handle.config.maint_margin_bps,
            )
        } else {
            0
        };
        Ok(PositionView {
            net_size: position.net_size,
            entry_price: position.entry_price,
            mark_price,
            unrealized_pnl,
            liquidation_price,
        })
    }

    /// Set the mark price for an instrument and refresh its premium
    /// index from the current top of book.
    ///
    /// # Errors
    /// [`CoreError::UnknownInstrument`] or [`CoreError::InvalidOrder`]
    /// for a non-positive mark.
    pub fn admin_set_mark(&self, instrument_id: InstrumentId, price: Price) -> Result<(), CoreError> {
        if price <= 0 {
            return Err(CoreError::InvalidOrder("mark price must be positive".to_string()));
        }
        let handle = self.handle(instrument_id)?;
        handle.mark_price.store(price, Ordering::Release);
        let book = handle.engine.book();
        self.funding.update_premium_index(
            instrument_id,
            book.best_bid().unwrap_or(0),
            book.best_ask().unwrap_or(0),
            price,
            crate::utils::current_time_nanos(),
        );
        Ok(())
    }

    /// Current mark price (zero when unset).
    ///
    /// # Errors
    /// [`CoreError::UnknownInstrument`].
    pub fn mark_price(&self, instrument_id: InstrumentId) -> Result<Price, CoreError> {
        Ok(self.handle(instrument_id)?.mark_price.load(Ordering::Acquire))
    }

    /// Run one funding settlement for the instrument at its current
    /// mark, emitting one `FUNDING_SETTLED` event per holder.
    ///
    /// # Errors
    /// [`CoreError::InvalidOrder`] when no mark is set, or arithmetic
    /// overflow.
    pub fn admin_trigger_funding(
        &self,
        instrument_id: InstrumentId,
    ) -> Result<Vec<FundingSettlement>, CoreError> {
        let handle = self.handle(instrument_id)?;
        let mark = handle.mark_price.load(Ordering::Acquire);
        if mark == 0 {
            return Err(CoreError::InvalidOrder(
                "cannot settle funding without a mark price".to_string(),
            ));
        }
        let settlements = self.funding.settle(instrument_id, mark)?;
        for s in &settlements {
            self.sink.publish(EventBody {
                instrument_id,
                payload: EventPayload::FundingSettled {
                    user_id: s.user_id,
                    position: s.position,
                    mark_price: s.mark_price,
                    rate_bps: s.rate_bps,
                    payment: s.payment,
                },
            });
        }
        counter!("controller_funding_settlements").increment(settlements.len() as u64);
        Ok(settlements)
    }

    /// Settle every instrument whose boundary has passed.
    ///
    /// # Errors
    /// Propagates the first settlement failure.
    pub fn poll_funding(&self, now_ns: i64) -> Result<Vec<FundingSettlement>, CoreError> {
        let mut out = Vec::new();
        let mut ids: Vec<InstrumentId> = self.instruments.keys().copied().collect();
        ids.sort_unstable();
        for instrument_id in ids {
            if self.funding.should_settle(instrument_id, now_ns)
                && self.mark_price(instrument_id)? != 0
            {
                out.extend(self.admin_trigger_funding(instrument_id)?);
            }
        }
        Ok(out)
    }

    /// Assess one holder's risk at the current mark.
    ///
    /// # Errors
    /// [`CoreError::UnknownInstrument`] or arithmetic overflow.
    pub fn assess_risk(
        &self,
        user_id: UserId,
        instrument_id: InstrumentId,
    ) -> Result<RiskAssessment, CoreError> {
        let handle = self.handle(instrument_id)?;
        let mark = handle.mark_price.load(Ordering::Acquire);
        Ok(self.evaluator.assess(
            user_id,
            instrument_id,
            mark,
            handle.config.maint_margin_bps,
            handle.config.liquidation_threshold_bps,
        )?)
    }

    /// Liquidate every position at or past the threshold on one
    /// instrument. Liquidation takers bypass rate limits and margin
    /// freezes and never rest.
    ///
    /// # Errors
    /// Propagates submission failures of the reducing orders.
    pub fn run_liquidations(
        &self,
        instrument_id: InstrumentId,
    ) -> Result<Vec<LiquidationOutcome>, CoreError> {
        let handle = self.handle(instrument_id)?;
        let mark = handle.mark_price.load(Ordering::Acquire);
        if mark == 0 {
            warn!("liquidation: instrument {instrument_id} has no mark price");
            return Ok(Vec::new());
        }
        let candidates = self.evaluator.candidates(
            instrument_id,
            mark,
            handle.config.maint_margin_bps,
            handle.config.liquidation_threshold_bps,
        )?;

        let mut outcomes = Vec::new();
        for assessment in candidates {
            let order_id = self.next_order_id.fetch_add(1, Ordering::AcqRel);
            let order = self.evaluator.build_order(&assessment, order_id);
            let fund_before = self.ledger.balance(INSURANCE_FUND_ACCOUNT);
            let report = self.dispatch_submit(handle, order)?;
            let fund_after = self.ledger.balance(INSURANCE_FUND_ACCOUNT);
            let insurance_draw = (fund_before - fund_after).max(0);

            let liquidated: Quantity = report.trades.iter().map(|t| t.quantity).sum();
            self.sink.publish(EventBody {
                instrument_id,
                payload: EventPayload::Liquidated {
                    user_id: assessment.user_id,
                    quantity: liquidated,
                    mark_price: mark,
                    insurance_draw,
                },
            });
            counter!("controller_liquidations").increment(1);
            info!(
                "liquidation: user {} reduced by {liquidated} on instrument {instrument_id} \
                 (insurance draw {insurance_draw})",
                assessment.user_id
            );
            outcomes.push(LiquidationOutcome {
                assessment,
                report,
                insurance_draw,
            });
        }
        Ok(outcomes)
    }

    /// Credit a user's balance (administrative deposit).
    ///
    /// # Errors
    /// [`CoreError::InvalidOrder`] for non-positive amounts.
    pub fn admin_deposit(&self, user_id: UserId, amount: i64) -> Result<i64, CoreError> {
        if amount <= 0 {
            return Err(CoreError::InvalidOrder("deposit must be positive".to_string()));
        }
        self.ledger.adjust(user_id, amount);
        let balance_after = self.ledger.balance(user_id);
        self.sink.publish(EventBody {
            instrument_id: 0,
            payload: EventPayload::BalanceUpdated {
                user_id,
                delta: amount,
                balance_after,
                reason: BalanceReason::Deposit,
            },
        });
        Ok(balance_after)
    }

    /// Debit a user's balance (administrative withdrawal).
    ///
    /// # Errors
    /// [`CoreError::InsufficientBalance`] when the available balance
    /// cannot cover the amount.
    pub fn admin_withdraw(&self, user_id: UserId, amount: i64) -> Result<i64, CoreError> {
        if amount <= 0 {
            return Err(CoreError::InvalidOrder("withdrawal must be positive".to_string()));
        }
        let available = self.ledger.available(user_id);
        if available < amount || !self.ledger.adjust(user_id, -amount) {
            return Err(CoreError::InsufficientBalance {
                requested: amount,
                available,
            });
        }
        let balance_after = self.ledger.balance(user_id);
        self.sink.publish(EventBody {
            instrument_id: 0,
            payload: EventPayload::BalanceUpdated {
                user_id,
                delta: -amount,
                balance_after,
                reason: BalanceReason::Withdrawal,
            },
        });
        Ok(balance_after)
    }

    /// Set one holder's absolute position limit.
    ///
    /// # Errors
    /// [`CoreError::UnknownInstrument`].
    pub fn admin_set_position_limit(
        &self,
        user_id: UserId,
        instrument_id: InstrumentId,
        limit: Quantity,
    ) -> Result<(), CoreError> {
        self.handle(instrument_id)?;
        self.positions.set_limit(user_id, instrument_id, limit);
        Ok(())
    }

    /// The underlying event log.
    #[must_use]
    pub fn wal(&self) -> &Arc<EventLog> {
        &self.wal
    }

    /// Capture the complete state at the given sequence.
    #[must_use]
    pub fn state_dump(&self, sequence: u64) -> StateDump {
        let mut books: Vec<BookDump> = self
            .instruments
            .values()
            .map(|handle| BookDump {
                instrument_id: handle.config.instrument_id,
                last_trade_price: handle.engine.book().last_trade_price().unwrap_or(0),
                trade_sequence: handle.engine.trade_sequence(),
                orders: handle
                    .engine
                    .book()
                    .resting_orders()
                    .iter()
                    .map(|o| RestingOrderDump::from_order(o))
                    .collect(),
            })
            .collect();
        books.sort_by_key(|b| b.instrument_id);
        StateDump {
            sequence,
            next_order_id: self.next_order_id.load(Ordering::Acquire),
            accounts: self.ledger.dump(),
            positions: self.positions.dump(),
            books,
            funding: self.funding.dump(),
        }
    }

    /// Digest of ledger, positions and books: the replay-determinism
    /// comparison value.
    #[must_use]
    pub fn state_digest(&self) -> String {
        self.state_dump(self.wal.committed_sequence()).core_digest()
    }

    /// Flush the log and write a full snapshot at the committed
    /// sequence. Returns the snapshot path.
    ///
    /// # Errors
    /// Propagates flush and snapshot I/O failures.
    pub fn take_snapshot(&self) -> Result<PathBuf, CoreError> {
        let committed = self.wal.flush()?;
        let dump = self.state_dump(committed);
        Ok(write_snapshot(
            &self.config.data_dir,
            &dump,
            SnapshotSections::full(),
        )?)
    }

    /// Stop accepting work, drain the matching threads and flush the
    /// log.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("controller: shutting down");
        for handle in self.instruments.values() {
            let _ = handle.tx.send(Command::Halt);
            if let Ok(mut guard) = handle.worker.lock()
                && let Some(join) = guard.take()
            {
                let _ = join.join();
            }
        }
        if let Err(err) = self.wal.flush() {
            error!("controller: final flush failed: {err}");
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn handle(&self, instrument_id: InstrumentId) -> Result<&InstrumentHandle, CoreError> {
        self.instruments
            .get(&instrument_id)
            .ok_or(CoreError::UnknownInstrument(instrument_id))
    }

    fn margin_basis(
        &self,
        handle: &InstrumentHandle,
        request: &SubmitRequest,
    ) -> Result<Price, CoreError> {
        if request.price > 0 {
            return Ok(request.price);
        }
        let mark = handle.mark_price.load(Ordering::Acquire);
        if mark > 0 {
            return Ok(mark);
        }
        let book = handle.engine.book();
        let opposite = match request.side {
            Side::Buy => book.best_ask(),
            Side::Sell => book.best_bid(),
        };
        opposite.ok_or_else(|| {
            CoreError::InvalidOrder(
                "market order needs a mark price or opposite-side liquidity".to_string(),
            )
        })
    }

    fn dispatch_submit(
        &self,
        handle: &InstrumentHandle,
        order: Arc<Order>,
    ) -> Result<ExecutionReport, CoreError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(handle, Command::Submit {
            order,
            reply: reply_tx,
        })?;
        reply_rx.recv().map_err(|_| CoreError::Shutdown)?
    }

    fn send(&self, handle: &InstrumentHandle, command: Command) -> Result<(), CoreError> {
        match handle.tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CoreError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(CoreError::Shutdown),
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Matching thread ────────────────────────────────────────────────────────

struct InstrumentWorker {
    instrument_id: InstrumentId,
    leverage_bps: i64,
    engine: Arc<MatchingEngine>,
    ledger: Arc<AccountLedger>,
    positions: Arc<PositionBook>,
    sink: Arc<dyn EventSink>,
}

impl InstrumentWorker {
    fn run(self, rx: Receiver<Command>) {
        info!("matching thread for instrument {} started", self.instrument_id);
        while let Ok(command) = rx.recv() {
            match command {
                Command::Submit { order, reply } => {
                    let response = self.handle_submit(order);
                    let _ = reply.send(response);
                }
                Command::Cancel {
                    order_id,
                    user_id,
                    reply,
                } => {
                    let response = self.handle_cancel(order_id, user_id);
                    let _ = reply.send(response);
                }
                Command::Halt => break,
            }
        }
        info!("matching thread for instrument {} stopped", self.instrument_id);
    }

    fn handle_submit(&self, order: Arc<Order>) -> Result<ExecutionReport, CoreError> {
        match self.engine.process(Arc::clone(&order)) {
            Ok(output) => {
                self.settle(&order, &output);
                Ok(output.report)
            }
            Err(err) => {
                // The engine emitted the rejection; the tentative margin
                // freeze rolls back here, before anything was durable
                // for this order beyond the rejection record.
                self.release_freeze(&order, order.quantity);
                Err(err.into())
            }
        }
    }

    fn handle_cancel(&self, order_id: OrderId, user_id: UserId) -> Result<CancelAck, CoreError> {
        let report = self.engine.cancel(order_id, user_id)?;
        self.release_freeze(&report.order, report.remaining);
        Ok(CancelAck {
            order_id,
            remaining: report.remaining,
        })
    }

    /// Apply ledger and position effects of one processed order, in the
    /// same order as the emitted events: fills, then self-trade maker
    /// cancels, then the taker's own cancelled remainder.
    fn settle(&self, taker: &Arc<Order>, output: &ProcessOutput) {
        for fill in &output.fills {
            let mut parties = [taker, &fill.maker];
            parties.sort_by_key(|o| o.user_id);
            for order in parties {
                self.settle_party(order, fill.quantity, fill.price);
            }
        }
        for maker in &output.cancelled_makers {
            self.release_freeze(maker, maker.remaining());
        }
        if output.report.status == OrderStatus::Cancelled && output.report.remaining > 0 {
            self.release_freeze(taker, output.report.remaining);
        }
    }

    fn settle_party(&self, order: &Arc<Order>, quantity: Quantity, price: Price) {
        let outcome =
            self.positions
                .apply_fill(order.user_id, self.instrument_id, quantity, order.side, price);

        // Margin frozen for the filled quantity: the exposure-increasing
        // share becomes position margin, the reducing share thaws.
        if !order.is_liquidation {
            let increase = quantity - outcome.reduced;
            if increase > 0 {
                let moved = fatal_calc(calc::required_margin(
                    order.margin_basis,
                    increase,
                    self.leverage_bps,
                ));
                self.ledger.fill_margin(order.user_id, moved);
            }
            if outcome.reduced > 0 {
                let thawed = fatal_calc(calc::required_margin(
                    order.margin_basis,
                    outcome.reduced,
                    self.leverage_bps,
                ));
                self.ledger.unfreeze(order.user_id, thawed);
            }
        }
        if outcome.reduced > 0 {
            let released = fatal_calc(calc::required_margin(
                outcome.entry_before,
                outcome.reduced,
                self.leverage_bps,
            ));
            self.ledger.release_margin(order.user_id, released);

            let was_long = outcome.previous_net > 0;
            let pnl = fatal_calc(calc::pnl(
                outcome.entry_before,
                price,
                outcome.reduced,
                was_long,
            ));
            if pnl != 0 {
                self.ledger.settle_with_insurance(order.user_id, pnl);
                let balance_after = self.ledger.balance(order.user_id);
                self.sink.publish(EventBody {
                    instrument_id: self.instrument_id,
                    payload: EventPayload::BalanceUpdated {
                        user_id: order.user_id,
                        delta: pnl,
                        balance_after,
                        reason: BalanceReason::TradePnl,
                    },
                });
            }
        }
    }

    fn release_freeze(&self, order: &Order, remaining: Quantity) {
        if order.is_liquidation || remaining <= 0 {
            return;
        }
        let amount = fatal_calc(calc::required_margin(
            order.margin_basis,
            remaining,
            self.leverage_bps,
        ));
        self.ledger.unfreeze(order.user_id, amount);
    }
}

/// Settlement arithmetic already validated at admission cannot overflow;
/// if it does, the log and in-memory state can no longer be reconciled.
fn fatal_calc(result: Result<i64, CalcError>) -> i64 {
    match result {
        Ok(value) => value,
        Err(err) => {
            error!("determinism violation in settlement arithmetic: {err}");
            std::process::abort();
        }
    }
}
