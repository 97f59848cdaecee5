//! Convenience re-exports for the common path: submit orders, inspect
//! books, read accounts and positions.
//!
//! ```
//! use perpcore_rs::prelude::*;
//! ```

pub use crate::calc::{
    CalcError, InstrumentId, OrderId, PRICE_SCALE, Price, QTY_SCALE, Quantity, SequenceId,
    TimestampNs, UserId,
};
pub use crate::control::config::{CoreConfig, InstrumentConfig};
pub use crate::control::{
    CancelAck, Controller, CoreError, LiquidationOutcome, PositionView, SubmitRequest,
};
pub use crate::engine::types::{
    DepthLevel, DepthSnapshot, ExecutionReport, Order, OrderKind, OrderStatus, SelfTradePolicy,
    Side, Trade,
};
pub use crate::engine::{EngineError, MatchingEngine, OrderBook};
pub use crate::ledger::position::{Position, PositionBook};
pub use crate::ledger::{Account, AccountLedger, AccountStats, INSURANCE_FUND_ACCOUNT};
pub use crate::risk::{
    FundingScheduler, FundingSettlement, LiquidationEvaluator, RiskAssessment,
};
pub use crate::wal::{
    Event, EventBody, EventKind, EventLog, EventPayload, EventSink, ReplayControl, WalConfig,
    WalError,
};
