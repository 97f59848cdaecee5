//! Shared helpers for the integration suites.
#![allow(dead_code)]

use perpcore_rs::calc::{PRICE_SCALE, QTY_SCALE};
use perpcore_rs::control::config::{CoreConfig, InstrumentConfig};
use perpcore_rs::control::{Controller, SubmitRequest};
use perpcore_rs::engine::types::{OrderKind, Side};
use perpcore_rs::{ExecutionReport, InstrumentId, Price, Quantity, UserId};
use std::path::Path;

/// The instrument every test trades.
pub const INSTRUMENT: InstrumentId = 1;

/// Scaled price from human units (tick = 1.0).
pub fn px(units: i64) -> Price {
    units * PRICE_SCALE
}

/// Scaled quantity from human tenths (step = 0.1).
pub fn qty_tenths(tenths: i64) -> Quantity {
    tenths * (QTY_SCALE / 10)
}

/// An instrument with human-friendly boundaries: tick 1.0, step 0.1.
pub fn test_instrument() -> InstrumentConfig {
    let mut cfg = InstrumentConfig::with_defaults(INSTRUMENT, "TEST-PERP");
    cfg.tick_size = PRICE_SCALE;
    cfg.qty_step = QTY_SCALE / 10;
    cfg.min_price = PRICE_SCALE;
    cfg.min_quantity = QTY_SCALE / 10;
    cfg
}

/// A core rooted at `dir` serving the test instrument.
pub fn open_core(dir: &Path) -> Controller {
    let config = CoreConfig::single_instrument(dir.to_path_buf(), test_instrument());
    Controller::open(config).expect("core must open")
}

/// Fund a user generously.
pub fn fund(core: &Controller, user: UserId) {
    core.admin_deposit(user, px(1_000_000)).expect("deposit");
}

/// Submit a limit order.
pub fn limit(
    core: &Controller,
    user: UserId,
    side: Side,
    price_units: i64,
    tenths: i64,
) -> ExecutionReport {
    core.submit_order(SubmitRequest {
        user_id: user,
        instrument_id: INSTRUMENT,
        side,
        kind: OrderKind::Limit,
        price: px(price_units),
        quantity: qty_tenths(tenths),
        client_order_id: None,
    })
    .expect("limit order accepted")
}

/// Submit a market order.
pub fn market(core: &Controller, user: UserId, side: Side, tenths: i64) -> ExecutionReport {
    core.submit_order(SubmitRequest {
        user_id: user,
        instrument_id: INSTRUMENT,
        side,
        kind: OrderKind::Market,
        price: 0,
        quantity: qty_tenths(tenths),
        client_order_id: None,
    })
    .expect("market order accepted")
}
