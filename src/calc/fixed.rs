//! Fixed-point scalar arithmetic shared by every subsystem.
//!
//! Prices and quantities are 64-bit signed integers scaled by
//! [`PRICE_SCALE`] / [`QTY_SCALE`]. Monetary products use a 128-bit
//! intermediate and divide by the appropriate scale. Every operation that
//! could leave the 64-bit domain returns [`CalcError::Overflow`] rather
//! than saturating; the single permitted saturation lives in
//! [`crate::calc::liquidation_price`].
//!
//! Conversion to and from floating point exists for the human-facing
//! edges only (display, config ingestion) and must never appear in the
//! matching or settlement paths.

use std::fmt;

/// Scaled integer price. One unit of human price equals `PRICE_SCALE`.
pub type Price = i64;

/// Scaled integer quantity. One unit of human quantity equals `QTY_SCALE`.
pub type Quantity = i64;

/// Monotonic sequence number assigned by the event log.
pub type SequenceId = u64;

/// Nanosecond timestamp derived from a sequence number.
pub type TimestampNs = i64;

/// User account identifier.
pub type UserId = u64;

/// Order identifier, unique within a core instance.
pub type OrderId = u64;

/// Instrument identifier. One matching thread per instrument.
pub type InstrumentId = u32;

/// Fixed scale for prices: 10^9.
pub const PRICE_SCALE: i64 = 1_000_000_000;

/// Fixed scale for quantities: 10^9.
pub const QTY_SCALE: i64 = 1_000_000_000;

/// Denominator for basis-point rates (1 bp = 0.01%).
pub const BPS_DENOMINATOR: i64 = 10_000;

/// Errors from fixed-point arithmetic.
///
/// `Overflow` outside the liquidation-price clamp is classed as a
/// determinism violation and must be propagated, never swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CalcError {
    /// A 128-bit intermediate did not fit the 64-bit result domain.
    Overflow,

    /// Division by zero was requested.
    DivideByZero,

    /// A floating-point input at the edge was not finite or not
    /// representable in the scaled domain.
    Unrepresentable,
}

impl fmt::Display for CalcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalcError::Overflow => write!(f, "fixed-point overflow"),
            CalcError::DivideByZero => write!(f, "fixed-point division by zero"),
            CalcError::Unrepresentable => {
                write!(f, "value not representable in the scaled integer domain")
            }
        }
    }
}

impl std::error::Error for CalcError {}

/// Convert a human-unit floating value into the scaled integer domain.
///
/// Edge use only (config ingestion, display round-trips).
///
/// # Errors
/// Returns [`CalcError::Unrepresentable`] for non-finite inputs or values
/// outside the `i64` range after scaling.
pub fn to_scaled(value: f64, scale: i64) -> Result<i64, CalcError> {
    if !value.is_finite() {
        return Err(CalcError::Unrepresentable);
    }
    let scaled = value * scale as f64;
    if scaled >= i64::MAX as f64 || scaled <= i64::MIN as f64 {
        return Err(CalcError::Unrepresentable);
    }
    Ok(scaled.round() as i64)
}

/// Convert a scaled integer back to a human-unit floating value.
///
/// Edge use only. The result is approximate by construction and must not
/// feed back into any deterministic computation.
#[must_use]
pub fn from_scaled(value: i64, scale: i64) -> f64 {
    value as f64 / scale as f64
}

/// Fixed-point multiplication: `(a * b) / scale` with a 128-bit
/// intermediate.
///
/// # Errors
/// [`CalcError::Overflow`] when the result leaves the `i64` domain,
/// [`CalcError::DivideByZero`] when `scale == 0`.
#[inline]
pub fn fixed_mul(a: i64, b: i64, scale: i64) -> Result<i64, CalcError> {
    if scale == 0 {
        return Err(CalcError::DivideByZero);
    }
    let wide = (a as i128) * (b as i128) / (scale as i128);
    i64::try_from(wide).map_err(|_| CalcError::Overflow)
}

/// Fixed-point division: `(a * scale) / b` with a 128-bit intermediate.
///
/// # Errors
/// [`CalcError::Overflow`] when the result leaves the `i64` domain,
/// [`CalcError::DivideByZero`] when `b == 0`.
#[inline]
pub fn fixed_div(a: i64, b: i64, scale: i64) -> Result<i64, CalcError> {
    if b == 0 {
        return Err(CalcError::DivideByZero);
    }
    let wide = (a as i128) * (scale as i128) / (b as i128);
    i64::try_from(wide).map_err(|_| CalcError::Overflow)
}

/// Overflow-checked addition.
///
/// # Errors
/// [`CalcError::Overflow`] when the sum wraps.
#[inline]
pub fn checked_add(a: i64, b: i64) -> Result<i64, CalcError> {
    a.checked_add(b).ok_or(CalcError::Overflow)
}

/// Overflow-checked subtraction.
///
/// # Errors
/// [`CalcError::Overflow`] when the difference wraps.
#[inline]
pub fn checked_sub(a: i64, b: i64) -> Result<i64, CalcError> {
    a.checked_sub(b).ok_or(CalcError::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_scaled_round_trip() {
        let scaled = to_scaled(50_000.5, PRICE_SCALE);
        assert_eq!(scaled, Ok(50_000_500_000_000));
        let back = from_scaled(50_000_500_000_000, PRICE_SCALE);
        assert!((back - 50_000.5).abs() < 1e-9);
    }

    #[test]
    fn test_to_scaled_rejects_non_finite() {
        assert_eq!(to_scaled(f64::NAN, PRICE_SCALE), Err(CalcError::Unrepresentable));
        assert_eq!(
            to_scaled(f64::INFINITY, PRICE_SCALE),
            Err(CalcError::Unrepresentable)
        );
    }

    #[test]
    fn test_fixed_mul_basic() {
        // 2.0 * 3.0 = 6.0 in the scaled domain
        let a = 2 * PRICE_SCALE;
        let b = 3 * QTY_SCALE;
        assert_eq!(fixed_mul(a, b, QTY_SCALE), Ok(6 * PRICE_SCALE));
    }

    #[test]
    fn test_fixed_mul_negative() {
        let a = -2 * PRICE_SCALE;
        let b = 3 * QTY_SCALE;
        assert_eq!(fixed_mul(a, b, QTY_SCALE), Ok(-6 * PRICE_SCALE));
    }

    #[test]
    fn test_fixed_mul_overflow_is_error() {
        assert_eq!(fixed_mul(i64::MAX, i64::MAX, 1), Err(CalcError::Overflow));
    }

    #[test]
    fn test_fixed_mul_zero_scale() {
        assert_eq!(fixed_mul(1, 1, 0), Err(CalcError::DivideByZero));
    }

    #[test]
    fn test_fixed_div_basic() {
        // 6.0 / 3.0 = 2.0
        let a = 6 * PRICE_SCALE;
        let b = 3 * PRICE_SCALE;
        assert_eq!(fixed_div(a, b, PRICE_SCALE), Ok(2 * PRICE_SCALE));
    }

    #[test]
    fn test_fixed_div_by_zero() {
        assert_eq!(fixed_div(1, 0, PRICE_SCALE), Err(CalcError::DivideByZero));
    }

    #[test]
    fn test_checked_add_sub() {
        assert_eq!(checked_add(1, 2), Ok(3));
        assert_eq!(checked_add(i64::MAX, 1), Err(CalcError::Overflow));
        assert_eq!(checked_sub(1, 2), Ok(-1));
        assert_eq!(checked_sub(i64::MIN, 1), Err(CalcError::Overflow));
    }
}
