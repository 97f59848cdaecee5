//! Pure deterministic calculation layer.
//!
//! Every arithmetic decision in the core flows through this module so
//! that any two replays of the same event log yield bit-identical
//! results. Functions here depend only on their arguments: no clock, no
//! RNG, no floating point.

mod fixed;

pub use fixed::{
    BPS_DENOMINATOR, CalcError, InstrumentId, OrderId, PRICE_SCALE, Price, QTY_SCALE, Quantity,
    SequenceId, TimestampNs, UserId, checked_add, checked_sub, fixed_div, fixed_mul, from_scaled,
    to_scaled,
};

/// Base timestamp for sequence-derived event times:
/// 2021-01-01T00:00:00Z in nanoseconds.
pub const DEFAULT_BASE_TIMESTAMP: TimestampNs = 1_609_459_200_000_000_000;

/// Funding rate clamp: ±75 bps (±0.75%) per settlement interval.
pub const FUNDING_RATE_CLAMP_BPS: i64 = 75;

/// Whether a taker at `taker_price` can execute against a maker resting
/// at `maker_price`.
///
/// Buy takers match when `taker_price >= maker_price`; sell takers when
/// `taker_price <= maker_price`. A taker price of zero denotes a market
/// order and always matches.
#[inline]
#[must_use]
pub fn can_match(taker_price: Price, maker_price: Price, taker_is_buy: bool) -> bool {
    if taker_price == 0 {
        return true;
    }
    if taker_is_buy {
        taker_price >= maker_price
    } else {
        taker_price <= maker_price
    }
}

/// Execution price for a fill: the resting (maker) order sets it.
#[inline]
#[must_use]
pub fn trade_price(_taker_price: Price, maker_price: Price) -> Price {
    maker_price
}

/// Executed quantity for a fill: the smaller remaining side.
#[inline]
#[must_use]
pub fn trade_qty(taker_remaining: Quantity, maker_remaining: Quantity) -> Quantity {
    taker_remaining.min(maker_remaining)
}

/// Unrealized or realized PnL for a position of `size` (magnitude)
/// between `entry` and `current` prices.
///
/// Long: `(current - entry) * size`; short: `(entry - current) * size`.
///
/// # Errors
/// Propagates [`CalcError::Overflow`] from the fixed-point product.
pub fn pnl(entry: Price, current: Price, size: Quantity, is_long: bool) -> Result<i64, CalcError> {
    if size == 0 {
        return Ok(0);
    }
    let diff = if is_long {
        checked_sub(current, entry)?
    } else {
        checked_sub(entry, current)?
    };
    fixed_mul(diff, size, QTY_SCALE)
}

/// Initial margin required to carry `qty` at `price` under the given
/// leverage (in basis points; 10x leverage = 100_000 bps).
///
/// `margin = price * qty / QTY_SCALE * 10_000 / leverage_bps`
///
/// # Errors
/// [`CalcError::DivideByZero`] for zero leverage, [`CalcError::Overflow`]
/// when the notional leaves the 64-bit domain.
pub fn required_margin(price: Price, qty: Quantity, leverage_bps: i64) -> Result<i64, CalcError> {
    if leverage_bps == 0 {
        return Err(CalcError::DivideByZero);
    }
    let notional = (price as i128) * (qty as i128) / (QTY_SCALE as i128);
    let margin = notional * (BPS_DENOMINATOR as i128) / (leverage_bps as i128);
    i64::try_from(margin).map_err(|_| CalcError::Overflow)
}

/// Maintenance margin for a position of `qty` marked at `price`.
///
/// `maintenance = price * qty / QTY_SCALE * maint_bps / 10_000`
///
/// # Errors
/// [`CalcError::Overflow`] when the notional leaves the 64-bit domain.
pub fn maintenance_margin(price: Price, qty: Quantity, maint_bps: u32) -> Result<i64, CalcError> {
    let notional = (price as i128) * (qty as i128) / (QTY_SCALE as i128);
    let margin = notional * (maint_bps as i128) / (BPS_DENOMINATOR as i128);
    i64::try_from(margin).map_err(|_| CalcError::Overflow)
}

/// Price at which a position entered at `entry` hits its maintenance
/// margin.
///
/// Long: `entry * (10_000 - maint_bps) / 10_000`; short:
/// `entry * (10_000 + maint_bps) / 10_000`.
///
/// This is the one place in the core where saturation is permitted: the
/// result is clamped into the `i64` domain instead of erroring, because a
/// clamped liquidation bound is still conservative.
#[must_use]
pub fn liquidation_price(entry: Price, is_long: bool, maint_bps: u32) -> Price {
    let factor = if is_long {
        BPS_DENOMINATOR as i128 - maint_bps as i128
    } else {
        BPS_DENOMINATOR as i128 + maint_bps as i128
    };
    let wide = (entry as i128) * factor / (BPS_DENOMINATOR as i128);
    if wide > i64::MAX as i128 {
        i64::MAX
    } else if wide < i64::MIN as i128 {
        i64::MIN
    } else {
        wide as i64
    }
}

/// Funding payment owed by the holder of a signed position `size` marked
/// at `mark` for one settlement at `rate_bps`.
///
/// Positive result: the holder pays. A long position (positive size) with
/// a positive rate pays; a short position with a positive rate receives.
///
/// `payment = size * mark / QTY_SCALE * rate_bps / 10_000`
///
/// # Errors
/// [`CalcError::Overflow`] when the value leaves the 64-bit domain.
pub fn funding_payment(size: Quantity, mark: Price, rate_bps: i64) -> Result<i64, CalcError> {
    if size == 0 {
        return Ok(0);
    }
    let value = (size as i128) * (mark as i128) / (QTY_SCALE as i128);
    let payment = value * (rate_bps as i128) / (BPS_DENOMINATOR as i128);
    i64::try_from(payment).map_err(|_| CalcError::Overflow)
}

/// Premium index in basis points:
/// `((best_bid + best_ask) / 2 - mark) * 10_000 / mark`.
///
/// Returns zero when any input is zero (no quote or no mark), matching
/// the behavior expected by the funding scheduler on an empty book. The
/// result is clamped into the `i64` domain.
#[must_use]
pub fn premium_index_bps(best_bid: Price, best_ask: Price, mark: Price) -> i64 {
    if best_bid == 0 || best_ask == 0 || mark == 0 {
        return 0;
    }
    let mid = (best_bid as i128 + best_ask as i128) / 2;
    let wide = (mid - mark as i128) * (BPS_DENOMINATOR as i128) / (mark as i128);
    wide.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Funding rate in basis points: premium index plus interest rate,
/// clamped to ±[`FUNDING_RATE_CLAMP_BPS`].
#[inline]
#[must_use]
pub fn funding_rate_bps(premium_bps: i64, interest_bps: i64) -> i64 {
    premium_bps
        .saturating_add(interest_bps)
        .clamp(-FUNDING_RATE_CLAMP_BPS, FUNDING_RATE_CLAMP_BPS)
}

/// Deterministic event timestamp: `base + sequence` nanoseconds.
///
/// A base of zero selects [`DEFAULT_BASE_TIMESTAMP`]. Used instead of the
/// wall clock everywhere an event is recorded, so replay reproduces
/// identical timestamps.
#[inline]
#[must_use]
pub fn sequence_to_timestamp(sequence: SequenceId, base: TimestampNs) -> TimestampNs {
    let base = if base == 0 { DEFAULT_BASE_TIMESTAMP } else { base };
    base.saturating_add(sequence as i64)
}

/// Inverse of [`sequence_to_timestamp`]. Timestamps before the base map
/// to sequence zero.
#[inline]
#[must_use]
pub fn timestamp_to_sequence(timestamp: TimestampNs, base: TimestampNs) -> SequenceId {
    let base = if base == 0 { DEFAULT_BASE_TIMESTAMP } else { base };
    if timestamp < base {
        return 0;
    }
    (timestamp - base) as u64
}

/// Combined price-time priority key, comparable with a single integer
/// compare.
///
/// Bids: `((MAX_PRICE - price) << 64) | sequence` so higher prices sort
/// first. Asks: `(price << 64) | sequence` so lower prices sort first.
/// Earlier sequences win within a price in both cases.
#[inline]
#[must_use]
pub fn sort_key(price: Price, sequence: SequenceId, is_buy: bool) -> u128 {
    let price_part = if is_buy {
        (i64::MAX as u64).wrapping_sub(price as u64)
    } else {
        price as u64
    };
    ((price_part as u128) << 64) | sequence as u128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_match_buy_and_sell() {
        assert!(can_match(100, 100, true));
        assert!(can_match(101, 100, true));
        assert!(!can_match(99, 100, true));
        assert!(can_match(100, 100, false));
        assert!(can_match(99, 100, false));
        assert!(!can_match(101, 100, false));
    }

    #[test]
    fn test_can_match_market_always_passes() {
        assert!(can_match(0, i64::MAX, true));
        assert!(can_match(0, 1, false));
    }

    #[test]
    fn test_trade_price_is_maker_price() {
        assert_eq!(trade_price(101, 100), 100);
        assert_eq!(trade_price(0, 100), 100);
    }

    #[test]
    fn test_trade_qty_is_min() {
        assert_eq!(trade_qty(5, 3), 3);
        assert_eq!(trade_qty(3, 5), 3);
    }

    #[test]
    fn test_pnl_long_and_short() {
        let size = QTY_SCALE; // 1.0
        let entry = 50_000 * PRICE_SCALE;
        let current = 51_000 * PRICE_SCALE;
        assert_eq!(pnl(entry, current, size, true), Ok(1_000 * PRICE_SCALE));
        assert_eq!(pnl(entry, current, size, false), Ok(-1_000 * PRICE_SCALE));
        assert_eq!(pnl(entry, current, 0, true), Ok(0));
    }

    #[test]
    fn test_required_margin_ten_x() {
        // 1.0 @ 50_000 with 10x leverage -> 5_000 margin
        let margin = required_margin(50_000 * PRICE_SCALE, QTY_SCALE, 100_000);
        assert_eq!(margin, Ok(5_000 * PRICE_SCALE));
    }

    #[test]
    fn test_required_margin_zero_leverage() {
        assert_eq!(
            required_margin(PRICE_SCALE, QTY_SCALE, 0),
            Err(CalcError::DivideByZero)
        );
    }

    #[test]
    fn test_maintenance_margin() {
        // 1.0 @ 50_000 with 50 bps maintenance -> 250
        let margin = maintenance_margin(50_000 * PRICE_SCALE, QTY_SCALE, 50);
        assert_eq!(margin, Ok(250 * PRICE_SCALE));
    }

    #[test]
    fn test_liquidation_price_long_short() {
        let entry = 50_000 * PRICE_SCALE;
        // 50 bps maintenance: long liquidates 0.5% below entry
        assert_eq!(liquidation_price(entry, true, 50), 49_750 * PRICE_SCALE);
        assert_eq!(liquidation_price(entry, false, 50), 50_250 * PRICE_SCALE);
    }

    #[test]
    fn test_liquidation_price_saturates() {
        // The documented clamp: no overflow error even at the extreme.
        let p = liquidation_price(i64::MAX, false, 10_000);
        assert_eq!(p, i64::MAX);
    }

    #[test]
    fn test_funding_payment_direction() {
        let long = QTY_SCALE; // +1.0
        let short = -QTY_SCALE;
        let mark = 50_000 * PRICE_SCALE;
        // Positive rate: long pays, short receives.
        let long_pays = funding_payment(long, mark, 10).unwrap();
        let short_pays = funding_payment(short, mark, 10).unwrap();
        assert!(long_pays > 0);
        assert_eq!(short_pays, -long_pays);
        // 10 bps of 50_000 = 50
        assert_eq!(long_pays, 50 * PRICE_SCALE);
    }

    #[test]
    fn test_premium_index_bps() {
        let mark = 50_000 * PRICE_SCALE;
        // mid == mark -> 0
        assert_eq!(premium_index_bps(mark, mark, mark), 0);
        // mid 0.5% above mark -> +50 bps
        let bid = 50_200 * PRICE_SCALE;
        let ask = 50_300 * PRICE_SCALE;
        assert_eq!(premium_index_bps(bid, ask, mark), 50);
        // missing quote -> 0
        assert_eq!(premium_index_bps(0, ask, mark), 0);
    }

    #[test]
    fn test_funding_rate_clamp() {
        assert_eq!(funding_rate_bps(100, 1), FUNDING_RATE_CLAMP_BPS);
        assert_eq!(funding_rate_bps(-100, -1), -FUNDING_RATE_CLAMP_BPS);
        assert_eq!(funding_rate_bps(10, 1), 11);
    }

    #[test]
    fn test_sequence_timestamp_round_trip() {
        let ts = sequence_to_timestamp(42, 0);
        assert_eq!(ts, DEFAULT_BASE_TIMESTAMP + 42);
        assert_eq!(timestamp_to_sequence(ts, 0), 42);
        assert_eq!(timestamp_to_sequence(DEFAULT_BASE_TIMESTAMP - 1, 0), 0);
    }

    #[test]
    fn test_sort_key_price_time_priority() {
        // Asks: lower price first, earlier sequence first within a price.
        assert!(sort_key(100, 1, false) < sort_key(101, 1, false));
        assert!(sort_key(100, 1, false) < sort_key(100, 2, false));
        // Bids: higher price first, earlier sequence first within a price.
        assert!(sort_key(101, 1, true) < sort_key(100, 1, true));
        assert!(sort_key(100, 1, true) < sort_key(100, 2, true));
    }

    #[test]
    fn test_sort_key_no_collision_across_sequences() {
        let a = sort_key(100, 7, false);
        let b = sort_key(100, 8, false);
        assert_ne!(a, b);
    }
}
