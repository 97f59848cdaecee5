//! # Deterministic Perpetual-Futures Matching Core
//!
//! The core of a perpetual-futures exchange: a price-time limit order
//! book and matching engine with integrated margin, position and
//! funding-rate accounting, backed by an append-only event log that
//! guarantees crash recovery and replay reproducibility.
//!
//! ## Key Properties
//!
//! - **Deterministic arithmetic**: every price, quantity and monetary
//!   computation runs through the fixed-point [`calc`] layer — 64-bit
//!   scaled integers, 128-bit intermediates, explicit overflow errors,
//!   no clocks, no floating point in any decision path. Two replays of
//!   the same event log produce byte-identical state.
//! - **Write-ahead durability**: the [`wal`] module appends
//!   length-prefixed, CRC-checked records to memory-mapped segment
//!   files and makes them durable with group commits; a committed
//!   high-water mark bounds what recovery may lose, and a torn tail
//!   above it is truncated while corruption below it refuses startup.
//! - **Single-writer matching**: one matching thread owns each
//!   instrument's [`engine::OrderBook`], so the hot path takes no locks
//!   on book state; concurrency comes from sharding by instrument and
//!   from per-user critical sections in the [`ledger`].
//! - **Risk as data flow**: the [`risk`] evaluators read positions and
//!   marks, and re-enter the [`control::Controller`] with ordinary
//!   orders (tagged as liquidation takers) rather than reaching into
//!   the matcher.
//!
//! ## Architecture
//!
//! ```text
//!  submit -> Controller -> validate -> rate-limit -> margin freeze
//!               |                                        |
//!               v                                        v
//!         per-instrument -> ORDER_PLACED -> match -> TRADE events
//!         matching thread      (WAL commit point)        |
//!               |                                        v
//!               +---------> ledger & position settlement -> reply
//!
//!  LiquidationEvaluator / FundingScheduler: periodic sweeps over
//!  positions -> events + reducing orders back through the Controller
//! ```
//!
//! ## Order Types
//!
//! Limit, market, post-only, immediate-or-cancel and fill-or-kill, with
//! per-instrument tick/step/min/max validation, FIFO price levels and a
//! configurable self-trade policy.
//!
//! ## Persistence Layout
//!
//! ```text
//! <data_dir>/wal/events-<start-sequence>.log   append-only segments
//! <data_dir>/snapshots/<sequence>.snap         replay seeds
//! <data_dir>/committed_hwm                     durable high-water mark
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use perpcore_rs::control::config::{CoreConfig, InstrumentConfig};
//! use perpcore_rs::control::{Controller, SubmitRequest};
//! use perpcore_rs::engine::types::{OrderKind, Side};
//! use perpcore_rs::calc::{PRICE_SCALE, QTY_SCALE};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoreConfig::single_instrument(
//!     "/var/lib/perpcore".into(),
//!     InstrumentConfig::with_defaults(1, "BTC-USD-PERP"),
//! );
//! let core = Controller::open(config)?;
//! core.admin_deposit(42, 100_000 * PRICE_SCALE)?;
//! let report = core.submit_order(SubmitRequest {
//!     user_id: 42,
//!     instrument_id: 1,
//!     side: Side::Buy,
//!     kind: OrderKind::Limit,
//!     price: 50_000 * PRICE_SCALE,
//!     quantity: QTY_SCALE / 10,
//!     client_order_id: None,
//! })?;
//! println!("order {} is {}", report.order_id, report.status);
//! # Ok(())
//! # }
//! ```

pub mod calc;
pub mod control;
pub mod engine;
pub mod ledger;
pub mod prelude;
pub mod risk;
mod utils;
pub mod wal;

pub use calc::{
    CalcError, InstrumentId, OrderId, PRICE_SCALE, Price, QTY_SCALE, Quantity, SequenceId,
    TimestampNs, UserId,
};
pub use control::config::{CoreConfig, InstrumentConfig};
pub use control::{CancelAck, Controller, CoreError, PositionView, SubmitRequest};
pub use engine::types::{
    DepthLevel, DepthSnapshot, ExecutionReport, Order, OrderKind, OrderStatus, SelfTradePolicy,
    Side, Trade,
};
pub use engine::{EngineError, MatchingEngine, OrderBook};
pub use ledger::position::PositionBook;
pub use ledger::{AccountLedger, AccountStats, INSURANCE_FUND_ACCOUNT};
pub use risk::{FundingScheduler, FundingSettlement, LiquidationEvaluator, RiskAssessment};
pub use utils::{current_time_millis, current_time_nanos};
pub use wal::{Event, EventKind, EventLog, EventSink, WalError};
