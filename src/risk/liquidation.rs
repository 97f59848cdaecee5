//! Risk assessment and liquidation-order production.
//!
//! The evaluator reads ledger and position state and produces reducing
//! orders; it never reaches into the matcher. Orders it builds re-enter
//! the controller like any other order, tagged as liquidation takers so
//! they bypass rate limits and never rest.

use crate::calc::{self, BPS_DENOMINATOR, CalcError, InstrumentId, OrderId, Price, Quantity, UserId};
use crate::engine::types::{Order, OrderKind, Side};
use crate::ledger::AccountLedger;
use crate::ledger::position::PositionBook;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Risk picture of one holder on one instrument at a mark price.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RiskAssessment {
    /// The holder.
    pub user_id: UserId,
    /// The instrument.
    pub instrument_id: InstrumentId,
    /// Signed net position size.
    pub net_size: Quantity,
    /// `|net_size| * mark` in monetary units.
    pub position_value: i64,
    /// `position_value * maint_bps / 10_000`.
    pub maintenance_margin: i64,
    /// The holder's spendable balance.
    pub available: i64,
    /// `maintenance_margin * 10_000 / available`; saturated when the
    /// holder has no available balance.
    pub risk_ratio_bps: i64,
    /// Whether the risk ratio reached the liquidation threshold.
    pub is_liquidatable: bool,
}

/// Computes risk ratios over ledger and position snapshots and builds
/// the reducing orders that close liquidatable positions.
pub struct LiquidationEvaluator {
    ledger: Arc<AccountLedger>,
    positions: Arc<PositionBook>,
}

impl LiquidationEvaluator {
    /// Create an evaluator over shared ledger and position state.
    #[must_use]
    pub fn new(ledger: Arc<AccountLedger>, positions: Arc<PositionBook>) -> Self {
        Self { ledger, positions }
    }

    /// Assess one holder at `mark`.
    ///
    /// # Errors
    /// Propagates [`CalcError::Overflow`] from the fixed-point products.
    pub fn assess(
        &self,
        user_id: UserId,
        instrument_id: InstrumentId,
        mark: Price,
        maint_bps: u32,
        threshold_bps: i64,
    ) -> Result<RiskAssessment, CalcError> {
        let position = self.positions.get(user_id, instrument_id);
        let size_abs = position.net_size.abs();
        let position_value = calc::fixed_mul(mark, size_abs, calc::QTY_SCALE)?;
        let maintenance_margin = calc::maintenance_margin(mark, size_abs, maint_bps)?;
        let available = self.ledger.available(user_id);

        let risk_ratio_bps = if size_abs == 0 {
            0
        } else if available <= 0 {
            i64::MAX
        } else {
            let wide = (maintenance_margin as i128) * (BPS_DENOMINATOR as i128)
                / (available as i128);
            wide.clamp(0, i64::MAX as i128) as i64
        };
        let is_liquidatable = size_abs != 0 && risk_ratio_bps >= threshold_bps;

        Ok(RiskAssessment {
            user_id,
            instrument_id,
            net_size: position.net_size,
            position_value,
            maintenance_margin,
            available,
            risk_ratio_bps,
            is_liquidatable,
        })
    }

    /// Sweep the instrument's open holders in ascending user id and
    /// return those at or past the liquidation threshold.
    ///
    /// # Errors
    /// Propagates [`CalcError::Overflow`] from any assessment.
    pub fn candidates(
        &self,
        instrument_id: InstrumentId,
        mark: Price,
        maint_bps: u32,
        threshold_bps: i64,
    ) -> Result<Vec<RiskAssessment>, CalcError> {
        let mut out = Vec::new();
        for user_id in self.positions.holders(instrument_id) {
            let assessment = self.assess(user_id, instrument_id, mark, maint_bps, threshold_bps)?;
            if assessment.is_liquidatable {
                debug!(
                    "liquidation: user {} on instrument {} at ratio {} bps",
                    user_id, instrument_id, assessment.risk_ratio_bps
                );
                out.push(assessment);
            }
        }
        Ok(out)
    }

    /// Build the reducing order that closes a liquidatable position:
    /// opposite side, full size, immediate-or-cancel at market price,
    /// tagged as a liquidation taker.
    #[must_use]
    pub fn build_order(&self, assessment: &RiskAssessment, order_id: OrderId) -> Arc<Order> {
        let side = if assessment.net_size > 0 {
            Side::Sell
        } else {
            Side::Buy
        };
        let mut order = Order::new(
            order_id,
            uuid::Uuid::new_v4(),
            assessment.user_id,
            assessment.instrument_id,
            side,
            OrderKind::ImmediateOrCancel,
            0,
            assessment.net_size.abs(),
        );
        order.is_liquidation = true;
        order.margin_basis = 0;
        Arc::new(order)
    }
}
