//! End-to-end scenarios through the controller: matching semantics,
//! event streams, margin accounting, funding and liquidation.

mod common;

use common::*;
use perpcore_rs::calc::PRICE_SCALE;
use perpcore_rs::control::config::CoreConfig;
use perpcore_rs::control::{Controller, CoreError, SubmitRequest};
use perpcore_rs::engine::types::{OrderKind, OrderStatus, Side};
use perpcore_rs::ledger::INSURANCE_FUND_ACCOUNT;
use perpcore_rs::wal::EventKind;

fn event_kinds(core: &Controller) -> Vec<EventKind> {
    let latest = core.wal().latest_sequence();
    if latest == 0 {
        return Vec::new();
    }
    core.wal()
        .range(1, latest)
        .expect("range")
        .map(|r| r.expect("event").kind())
        .collect()
}

#[test]
fn s1_exact_match() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    fund(&core, 2);

    let a = limit(&core, 1, Side::Sell, 50_000, 1);
    assert_eq!(a.status, OrderStatus::Pending);

    let b = limit(&core, 2, Side::Buy, 50_000, 1);
    assert_eq!(b.status, OrderStatus::Filled);
    assert_eq!(b.trades.len(), 1);
    let trade = &b.trades[0];
    assert_eq!(trade.price, px(50_000));
    assert_eq!(trade.quantity, qty_tenths(1));
    assert!(trade.is_taker_buy);
    assert_eq!(trade.buy_user_id, 2);
    assert_eq!(trade.sell_user_id, 1);

    // Book empty on both sides.
    let depth = core.query_book(INSTRUMENT, 10).unwrap();
    assert!(depth.bids.is_empty());
    assert!(depth.asks.is_empty());
    assert_eq!(depth.last_trade_price, Some(px(50_000)));

    // Positions opened on both sides; the long's liquidation estimate
    // sits 50 bps below entry.
    let long_view = core.query_position(2, INSTRUMENT).unwrap();
    assert_eq!(long_view.net_size, qty_tenths(1));
    assert_eq!(long_view.entry_price, px(50_000));
    assert_eq!(long_view.liquidation_price, px(49_750));
    assert_eq!(core.query_position(1, INSTRUMENT).unwrap().net_size, -qty_tenths(1));

    // Event stream: two deposits, two placements, the match pair and
    // the trade record.
    assert_eq!(
        event_kinds(&core),
        vec![
            EventKind::BalanceUpdated,
            EventKind::BalanceUpdated,
            EventKind::OrderPlaced,
            EventKind::OrderPlaced,
            EventKind::OrderMatched,
            EventKind::TradeExecuted,
        ]
    );
}

#[test]
fn s2_price_priority_across_levels() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    for user in [1, 2, 3] {
        fund(&core, user);
    }
    limit(&core, 1, Side::Sell, 49_900, 1);
    limit(&core, 2, Side::Sell, 50_000, 1);

    let c = limit(&core, 3, Side::Buy, 50_100, 1);
    assert_eq!(c.status, OrderStatus::Filled);
    assert_eq!(c.trades.len(), 1);
    assert_eq!(c.trades[0].price, px(49_900));

    // The worse-priced sell still rests untouched.
    let depth = core.query_book(INSTRUMENT, 10).unwrap();
    assert_eq!(depth.asks.len(), 1);
    assert_eq!(depth.asks[0].price, px(50_000));
    assert_eq!(depth.asks[0].quantity, qty_tenths(1));
}

#[test]
fn s3_fifo_within_level() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    for user in [1, 2, 3] {
        fund(&core, user);
    }
    limit(&core, 1, Side::Buy, 50_000, 1);
    limit(&core, 2, Side::Buy, 50_000, 2);

    let c = limit(&core, 3, Side::Sell, 50_000, 3);
    assert_eq!(c.status, OrderStatus::Filled);
    assert_eq!(c.trades.len(), 2);
    // First in, first matched.
    assert_eq!(c.trades[0].buy_user_id, 1);
    assert_eq!(c.trades[0].quantity, qty_tenths(1));
    assert_eq!(c.trades[1].buy_user_id, 2);
    assert_eq!(c.trades[1].quantity, qty_tenths(2));
    assert!(c.trades.iter().all(|t| t.price == px(50_000)));
    assert!(c.trades[0].sequence_id < c.trades[1].sequence_id);
}

#[test]
fn s4_partial_fill_rests_remainder() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    fund(&core, 2);
    limit(&core, 1, Side::Sell, 50_000, 10);

    let b = limit(&core, 2, Side::Buy, 50_000, 3);
    assert_eq!(b.status, OrderStatus::Filled);
    assert_eq!(b.trades.len(), 1);
    assert_eq!(b.trades[0].quantity, qty_tenths(3));

    let depth = core.query_book(INSTRUMENT, 10).unwrap();
    assert_eq!(depth.asks[0].quantity, qty_tenths(7));
}

#[test]
fn s5_market_order_exhausts_side() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    fund(&core, 2);
    limit(&core, 1, Side::Sell, 50_000, 1);
    limit(&core, 1, Side::Sell, 50_010, 1);

    let b = market(&core, 2, Side::Buy, 3);
    assert_eq!(b.trades.len(), 2);
    assert_eq!(b.trades[0].price, px(50_000));
    assert_eq!(b.trades[1].price, px(50_010));
    assert_eq!(b.status, OrderStatus::Cancelled);
    assert_eq!(b.remaining, qty_tenths(1));

    assert!(core.query_book(INSTRUMENT, 10).unwrap().asks.is_empty());
    assert!(event_kinds(&core).contains(&EventKind::OrderCancelled));
}

#[test]
fn market_order_on_empty_book_needs_price_basis() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    // No mark, no opposite liquidity: nothing to margin against.
    let err = core
        .submit_order(SubmitRequest {
            user_id: 1,
            instrument_id: INSTRUMENT,
            side: Side::Buy,
            kind: OrderKind::Market,
            price: 0,
            quantity: qty_tenths(1),
            client_order_id: None,
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOrder(_)));

    // With a mark the same order is admitted and cancelled with zero
    // trades and one cancellation event.
    core.admin_set_mark(INSTRUMENT, px(50_000)).unwrap();
    let events_before = core.wal().latest_sequence();
    let report = market(&core, 1, Side::Buy, 1);
    assert_eq!(report.status, OrderStatus::Cancelled);
    assert_eq!(report.remaining, qty_tenths(1));
    assert!(report.trades.is_empty());
    let kinds = event_kinds(&core);
    assert_eq!(
        &kinds[events_before as usize..],
        &[EventKind::OrderPlaced, EventKind::OrderCancelled]
    );
}

#[test]
fn place_and_cancel_restores_frozen_and_balance() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    let before = core.query_account(1);

    let report = limit(&core, 1, Side::Buy, 50_000, 1);
    let while_open = core.query_account(1);
    // 0.1 @ 50_000 with 10x leverage freezes 500.
    assert_eq!(while_open.frozen, before.frozen + px(500));
    assert_eq!(while_open.balance, before.balance);

    let ack = core.cancel_order(report.order_id, 1).unwrap();
    assert_eq!(ack.remaining, qty_tenths(1));
    let after = core.query_account(1);
    assert_eq!(after.frozen, before.frozen);
    assert_eq!(after.balance, before.balance);
}

#[test]
fn cancel_is_idempotent_typed_noop() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    let report = limit(&core, 1, Side::Buy, 50_000, 1);
    core.cancel_order(report.order_id, 1).unwrap();
    let events_after_cancel = core.wal().latest_sequence();

    let err = core.cancel_order(report.order_id, 1).unwrap_err();
    assert!(matches!(err, CoreError::AlreadyTerminal { .. }));
    // No state change, no event.
    assert_eq!(core.wal().latest_sequence(), events_after_cancel);

    let err = core.cancel_order(9_999, 1).unwrap_err();
    assert!(matches!(err, CoreError::NotFound(9_999)));
}

#[test]
fn cancel_wrong_user_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    let report = limit(&core, 1, Side::Buy, 50_000, 1);
    let err = core.cancel_order(report.order_id, 2).unwrap_err();
    assert!(matches!(err, CoreError::WrongUser { .. }));
    assert_eq!(core.query_book(INSTRUMENT, 1).unwrap().bids.len(), 1);
}

#[test]
fn cancel_partial_fill_emits_remaining() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    fund(&core, 2);
    let a = limit(&core, 1, Side::Sell, 50_000, 10);
    limit(&core, 2, Side::Buy, 50_000, 3);

    let ack = core.cancel_order(a.order_id, 1).unwrap();
    assert_eq!(ack.remaining, qty_tenths(7));
    assert!(event_kinds(&core).contains(&EventKind::OrderCancelled));
}

#[test]
fn fok_rejected_without_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    fund(&core, 2);
    limit(&core, 1, Side::Sell, 50_000, 1);
    let depth_before = core.query_book(INSTRUMENT, 10).unwrap();
    let frozen_before = core.query_account(2).frozen;

    let err = core
        .submit_order(SubmitRequest {
            user_id: 2,
            instrument_id: INSTRUMENT,
            side: Side::Buy,
            kind: OrderKind::FillOrKill,
            price: px(50_000),
            quantity: qty_tenths(3),
            client_order_id: None,
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::FokUnfillable { .. }));

    let depth_after = core.query_book(INSTRUMENT, 10).unwrap();
    assert_eq!(depth_before.asks, depth_after.asks);
    assert_eq!(depth_before.bids, depth_after.bids);
    // The tentative freeze rolled back.
    assert_eq!(core.query_account(2).frozen, frozen_before);
}

#[test]
fn post_only_would_cross_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    fund(&core, 2);
    limit(&core, 1, Side::Sell, 50_000, 1);

    let err = core
        .submit_order(SubmitRequest {
            user_id: 2,
            instrument_id: INSTRUMENT,
            side: Side::Buy,
            kind: OrderKind::PostOnly,
            price: px(50_000),
            quantity: qty_tenths(1),
            client_order_id: None,
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::PostOnlyWouldCross { .. }));
    assert_eq!(core.query_account(2).frozen, 0);
}

#[test]
fn insufficient_margin_rejected_before_admission() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    core.admin_deposit(1, px(10)).unwrap();
    let events_before = core.wal().latest_sequence();

    let err = core
        .submit_order(SubmitRequest {
            user_id: 1,
            instrument_id: INSTRUMENT,
            side: Side::Buy,
            kind: OrderKind::Limit,
            price: px(50_000),
            quantity: qty_tenths(1),
            client_order_id: None,
        })
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::InsufficientMargin { required, .. } if required == px(500)
    ));
    // Early rejection: nothing was logged.
    assert_eq!(core.wal().latest_sequence(), events_before);
}

#[test]
fn position_limit_enforced_at_admission() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    core.admin_set_position_limit(1, INSTRUMENT, qty_tenths(5))
        .unwrap();

    let err = core
        .submit_order(SubmitRequest {
            user_id: 1,
            instrument_id: INSTRUMENT,
            side: Side::Sell,
            kind: OrderKind::Limit,
            price: px(50_000),
            quantity: qty_tenths(6),
            client_order_id: None,
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::PositionLimit { .. }));
    assert!(limit(&core, 1, Side::Sell, 50_000, 5).trades.is_empty());
}

#[test]
fn rate_limit_rejects_burst_excess() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CoreConfig::single_instrument(dir.path().to_path_buf(), test_instrument());
    config.rate_limit.per_user_orders_per_second = 1;
    config.rate_limit.per_user_burst = 2;
    let core = Controller::open(config).unwrap();
    fund(&core, 1);
    // The deposit does not consume order tokens; two orders pass, the
    // third hits the per-user bucket.
    limit(&core, 1, Side::Buy, 50_000, 1);
    limit(&core, 1, Side::Buy, 49_999, 1);
    let err = core
        .submit_order(SubmitRequest {
            user_id: 1,
            instrument_id: INSTRUMENT,
            side: Side::Buy,
            kind: OrderKind::Limit,
            price: px(49_998),
            quantity: qty_tenths(1),
            client_order_id: None,
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::RateLimited));
}

#[test]
fn unknown_instrument_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    let err = core.query_book(99, 10).unwrap_err();
    assert!(matches!(err, CoreError::UnknownInstrument(99)));
}

#[test]
fn realized_pnl_settles_on_reducing_fill() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    fund(&core, 2);

    // User 2 opens a 0.1 long at 50_000 against user 1.
    limit(&core, 1, Side::Sell, 50_000, 1);
    limit(&core, 2, Side::Buy, 50_000, 1);
    let balance_before = core.query_account(2).balance;

    // User 2 closes at 51_000 against user 1's new bid: +100 profit.
    limit(&core, 1, Side::Buy, 51_000, 1);
    let close = limit(&core, 2, Side::Sell, 51_000, 1);
    assert_eq!(close.status, OrderStatus::Filled);

    let account = core.query_account(2);
    assert_eq!(account.balance, balance_before + px(100));
    assert_eq!(core.query_position(2, INSTRUMENT).unwrap().net_size, 0);
    assert_eq!(account.used_margin, 0);
    assert!(event_kinds(&core).contains(&EventKind::BalanceUpdated));
}

#[test]
fn funding_settlement_long_pays_short() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    fund(&core, 2);

    // User 2 long 0.1, user 1 short 0.1 at 50_000.
    limit(&core, 1, Side::Sell, 50_000, 1);
    limit(&core, 2, Side::Buy, 50_000, 1);
    let long_before = core.query_account(2).balance;
    let short_before = core.query_account(1).balance;

    // Empty book after the fill: premium index 0, rate = 1 bp interest.
    core.admin_set_mark(INSTRUMENT, px(50_000)).unwrap();
    let settlements = core.admin_trigger_funding(INSTRUMENT).unwrap();
    assert_eq!(settlements.len(), 2);

    // 1 bp of 0.1 * 50_000 notional = 0.5.
    let expected = PRICE_SCALE / 2;
    let long = settlements.iter().find(|s| s.user_id == 2).unwrap();
    let short = settlements.iter().find(|s| s.user_id == 1).unwrap();
    assert_eq!(long.payment, expected);
    assert_eq!(short.payment, -expected);
    assert_eq!(core.query_account(2).balance, long_before - expected);
    assert_eq!(core.query_account(1).balance, short_before + expected);

    let funding_events = event_kinds(&core)
        .iter()
        .filter(|k| **k == EventKind::FundingSettled)
        .count();
    assert_eq!(funding_events, 2);
}

#[test]
fn liquidation_closes_underwater_position() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    core.admin_deposit(INSURANCE_FUND_ACCOUNT, px(100_000)).unwrap();
    fund(&core, 2);
    core.admin_deposit(1, px(500)).unwrap();

    // User 1 opens a 0.1 long at 50_000 (all margin), then withdraws
    // almost everything once the freeze became position margin.
    limit(&core, 2, Side::Sell, 50_000, 1);
    let open = limit(&core, 1, Side::Buy, 50_000, 1);
    assert_eq!(open.status, OrderStatus::Filled);
    core.admin_withdraw(1, px(480)).unwrap();

    // Mark drops; user 2 quotes a bid the liquidation can hit.
    core.admin_set_mark(INSTRUMENT, px(45_000)).unwrap();
    limit(&core, 2, Side::Buy, 44_000, 1);

    let outcomes = core.run_liquidations(INSTRUMENT).unwrap();
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert_eq!(outcome.assessment.user_id, 1);
    assert!(outcome.assessment.is_liquidatable);
    assert_eq!(outcome.report.trades.len(), 1);
    assert_eq!(outcome.report.trades[0].price, px(44_000));

    // Realized loss of 600 against a 20 balance: 580 from the fund.
    assert_eq!(outcome.insurance_draw, px(580));
    assert_eq!(core.query_account(1).balance, 0);
    assert_eq!(core.query_position(1, INSTRUMENT).unwrap().net_size, 0);
    assert_eq!(
        core.query_account(INSURANCE_FUND_ACCOUNT).balance,
        px(100_000) - px(580)
    );
    assert!(event_kinds(&core).contains(&EventKind::Liquidated));

    // A second sweep finds nothing.
    assert!(core.run_liquidations(INSTRUMENT).unwrap().is_empty());
}

#[test]
fn depth_snapshot_serializes_for_market_data_edge() {
    let dir = tempfile::tempdir().unwrap();
    let core = open_core(dir.path());
    fund(&core, 1);
    limit(&core, 1, Side::Buy, 49_999, 2);
    let depth = core.query_book(INSTRUMENT, 5).unwrap();
    let json = depth.to_json().unwrap();
    assert!(json.contains("\"bids\""));
    assert!(json.contains("49999000000000"));
}
