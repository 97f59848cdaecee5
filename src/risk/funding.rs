//! Funding-rate tracking and periodic settlement.
//!
//! Per instrument the scheduler maintains a premium index, the clamped
//! funding rate and the next settlement boundary. Settlement sweeps the
//! non-zero position index in ascending user id and applies each
//! holder's payment through the ledger; the controller turns the
//! returned settlements into `FUNDING_SETTLED` events.
//!
//! The next settlement time advances by the fixed interval
//! (`next += interval`), never rescheduled from the wall clock, so a
//! replayed history settles at identical boundaries. The first-run
//! anchor is persisted with snapshots.

use crate::calc::{self, CalcError, InstrumentId, Price, TimestampNs, UserId};
use crate::ledger::AccountLedger;
use crate::ledger::position::PositionBook;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Bounded funding-rate history per instrument.
const HISTORY_CAP: usize = 1_000;

/// Scheduler parameters.
#[derive(Debug, Clone, Copy)]
pub struct FundingConfig {
    /// Settlement interval in nanoseconds.
    pub interval_ns: i64,
    /// Interest-rate component in basis points.
    pub interest_rate_bps: i64,
}

impl FundingConfig {
    /// Build from the controller's settings struct.
    #[must_use]
    pub fn from_settings(settings: &crate::control::config::FundingSettings) -> Self {
        Self {
            interval_ns: settings.interval_secs.saturating_mul(1_000_000_000),
            interest_rate_bps: settings.interest_rate_bps,
        }
    }
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            interval_ns: 8 * 3_600 * 1_000_000_000,
            interest_rate_bps: 1,
        }
    }
}

/// One historical funding-rate observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FundingRateRecord {
    /// The clamped funding rate.
    pub rate_bps: i64,
    /// The premium index that produced it.
    pub premium_index_bps: i64,
    /// When the rate was recorded.
    pub timestamp_ns: TimestampNs,
}

#[derive(Debug, Default)]
struct FundingState {
    premium_index_bps: i64,
    funding_rate_bps: i64,
    next_settlement_ns: TimestampNs,
    history: VecDeque<FundingRateRecord>,
}

/// Snapshot row for one instrument's funding state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingDump {
    /// The instrument.
    pub instrument_id: InstrumentId,
    /// Last premium index.
    pub premium_index_bps: i64,
    /// Last clamped rate.
    pub funding_rate_bps: i64,
    /// Persisted settlement anchor.
    pub next_settlement_ns: TimestampNs,
}

/// One holder's funding settlement.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FundingSettlement {
    /// The settled holder.
    pub user_id: UserId,
    /// The instrument.
    pub instrument_id: InstrumentId,
    /// Signed position at settlement.
    pub position: i64,
    /// Mark price used.
    pub mark_price: Price,
    /// Rate applied.
    pub rate_bps: i64,
    /// Payment owed by the holder (negative = received).
    pub payment: i64,
    /// Insurance-fund draw covering any shortfall.
    pub insurance_draw: i64,
}

/// Per-instrument funding scheduler.
pub struct FundingScheduler {
    config: FundingConfig,
    ledger: Arc<AccountLedger>,
    positions: Arc<PositionBook>,
    states: DashMap<InstrumentId, Mutex<FundingState>>,
}

impl FundingScheduler {
    /// Create a scheduler over shared ledger and position state.
    #[must_use]
    pub fn new(
        config: FundingConfig,
        ledger: Arc<AccountLedger>,
        positions: Arc<PositionBook>,
    ) -> Self {
        Self {
            config,
            ledger,
            positions,
            states: DashMap::new(),
        }
    }

    fn with_state<R>(&self, instrument_id: InstrumentId, f: impl FnOnce(&mut FundingState) -> R) -> R {
        let entry = self
            .states
            .entry(instrument_id)
            .or_insert_with(|| Mutex::new(FundingState::default()));
        let mut guard = lock_or_recover(entry.value());
        f(&mut guard)
    }

    /// Recompute the premium index from the current top of book and the
    /// mark, and refresh the clamped funding rate.
    pub fn update_premium_index(
        &self,
        instrument_id: InstrumentId,
        best_bid: Price,
        best_ask: Price,
        mark: Price,
        now_ns: TimestampNs,
    ) {
        let premium = calc::premium_index_bps(best_bid, best_ask, mark);
        let rate = calc::funding_rate_bps(premium, self.config.interest_rate_bps);
        self.with_state(instrument_id, |state| {
            state.premium_index_bps = premium;
            state.funding_rate_bps = rate;
            state.history.push_back(FundingRateRecord {
                rate_bps: rate,
                premium_index_bps: premium,
                timestamp_ns: now_ns,
            });
            while state.history.len() > HISTORY_CAP {
                state.history.pop_front();
            }
        });
        debug!(
            "funding: instrument {} premium {} bps rate {} bps",
            instrument_id, premium, rate
        );
    }

    /// The current clamped funding rate; the bare interest rate before
    /// any premium observation.
    #[must_use]
    pub fn current_rate_bps(&self, instrument_id: InstrumentId) -> i64 {
        self.with_state(instrument_id, |state| {
            if state.history.is_empty() {
                calc::funding_rate_bps(state.premium_index_bps, self.config.interest_rate_bps)
            } else {
                state.funding_rate_bps
            }
        })
    }

    /// The last premium index observation.
    #[must_use]
    pub fn premium_index_bps(&self, instrument_id: InstrumentId) -> i64 {
        self.with_state(instrument_id, |state| state.premium_index_bps)
    }

    /// Recent funding-rate history, oldest first.
    #[must_use]
    pub fn history(&self, instrument_id: InstrumentId) -> Vec<FundingRateRecord> {
        self.with_state(instrument_id, |state| state.history.iter().copied().collect())
    }

    /// Set the first settlement boundary if none exists yet. The anchor
    /// is wall-clock once, then persisted and advanced deterministically.
    pub fn anchor(&self, instrument_id: InstrumentId, now_ns: TimestampNs) {
        let interval = self.config.interval_ns;
        self.with_state(instrument_id, |state| {
            if state.next_settlement_ns == 0 {
                state.next_settlement_ns = now_ns.saturating_add(interval);
                info!(
                    "funding: anchored instrument {} at {}",
                    instrument_id, state.next_settlement_ns
                );
            }
        });
    }

    /// Next settlement boundary (zero before anchoring).
    #[must_use]
    pub fn next_settlement_ns(&self, instrument_id: InstrumentId) -> TimestampNs {
        self.with_state(instrument_id, |state| state.next_settlement_ns)
    }

    /// Whether a settlement boundary has been reached.
    #[must_use]
    pub fn should_settle(&self, instrument_id: InstrumentId, now_ns: TimestampNs) -> bool {
        let next = self.next_settlement_ns(instrument_id);
        next != 0 && now_ns >= next
    }

    /// Settle every open position on the instrument at `mark`.
    ///
    /// Positive rate: longs pay shorts. Payments apply through the
    /// insurance-backed settlement rule; the boundary advances by one
    /// interval regardless of how late the sweep runs.
    ///
    /// # Errors
    /// Propagates [`CalcError::Overflow`] from the payment product; no
    /// boundary advance happens in that case.
    pub fn settle(
        &self,
        instrument_id: InstrumentId,
        mark: Price,
    ) -> Result<Vec<FundingSettlement>, CalcError> {
        let rate_bps = self.current_rate_bps(instrument_id);
        let mut settlements = Vec::new();

        for user_id in self.positions.holders(instrument_id) {
            let position = self.positions.get(user_id, instrument_id);
            if position.net_size == 0 {
                continue;
            }
            let payment = calc::funding_payment(position.net_size, mark, rate_bps)?;
            if payment == 0 {
                continue;
            }
            let insurance_draw = self.ledger.settle_with_insurance(user_id, -payment);
            settlements.push(FundingSettlement {
                user_id,
                instrument_id,
                position: position.net_size,
                mark_price: mark,
                rate_bps,
                payment,
                insurance_draw,
            });
        }

        let interval = self.config.interval_ns;
        self.with_state(instrument_id, |state| {
            if state.next_settlement_ns != 0 {
                state.next_settlement_ns = state.next_settlement_ns.saturating_add(interval);
            }
        });
        info!(
            "funding: settled instrument {} at rate {} bps ({} holders)",
            instrument_id,
            rate_bps,
            settlements.len()
        );
        Ok(settlements)
    }

    /// Funding anchors and rates for snapshots.
    #[must_use]
    pub fn dump(&self) -> Vec<FundingDump> {
        let mut rows: Vec<FundingDump> = self
            .states
            .iter()
            .map(|entry| {
                let state = lock_or_recover(entry.value());
                FundingDump {
                    instrument_id: *entry.key(),
                    premium_index_bps: state.premium_index_bps,
                    funding_rate_bps: state.funding_rate_bps,
                    next_settlement_ns: state.next_settlement_ns,
                }
            })
            .collect();
        rows.sort_by_key(|r| r.instrument_id);
        rows
    }

    /// Restore anchors and rates from a snapshot.
    pub fn restore(&self, rows: &[FundingDump]) {
        self.states.clear();
        for row in rows {
            self.with_state(row.instrument_id, |state| {
                state.premium_index_bps = row.premium_index_bps;
                state.funding_rate_bps = row.funding_rate_bps;
                state.next_settlement_ns = row.next_settlement_ns;
            });
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
