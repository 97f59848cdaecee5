//! Per-(user, instrument) net positions, limits and entry tracking.

use crate::calc::{InstrumentId, Price, Quantity, UserId};
use crate::engine::types::Side;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// One holder's state on one instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Signed net size: positive long, negative short.
    pub net_size: Quantity,
    /// Average entry price of the current exposure; zero when flat.
    pub entry_price: Price,
    /// Absolute net-size limit; zero disables the limit.
    pub limit: Quantity,
}

impl Position {
    /// Whether the holder currently has exposure.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.net_size != 0
    }
}

/// The would-be position exceeds its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionLimitViolation {
    /// The net size the fill would produce.
    pub would_be_net: Quantity,
    /// The configured absolute limit.
    pub limit: Quantity,
}

impl fmt::Display for PositionLimitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "position limit exceeded: would-be net {} over limit {}",
            self.would_be_net, self.limit
        )
    }
}

impl std::error::Error for PositionLimitViolation {}

/// Effect of applying one fill to a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    /// Net size before the fill.
    pub previous_net: Quantity,
    /// Net size after the fill.
    pub new_net: Quantity,
    /// Portion of the fill that reduced existing exposure (realizes
    /// PnL against `entry_before`).
    pub reduced: Quantity,
    /// Entry price before the fill; basis for realized PnL.
    pub entry_before: Price,
    /// Whether the position crossed through zero.
    pub flipped: bool,
}

/// Snapshot row for one position, ordered by (user, instrument) in
/// dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDump {
    /// The holder.
    pub user_id: UserId,
    /// The instrument.
    pub instrument_id: InstrumentId,
    /// Signed net size.
    pub net_size: Quantity,
    /// Average entry price.
    pub entry_price: Price,
    /// Absolute limit (zero = unlimited).
    pub limit: Quantity,
}

/// All positions of all holders, with a per-instrument index of users
/// holding non-zero positions.
///
/// The index exists so funding settlement and liquidation sweeps visit
/// exactly the holders with exposure, in ascending user id, instead of
/// scanning every account ever seen.
#[derive(Debug, Default)]
pub struct PositionBook {
    positions: DashMap<(UserId, InstrumentId), Arc<Mutex<Position>>>,
    holders: DashMap<InstrumentId, Mutex<BTreeSet<UserId>>>,
}

impl PositionBook {
    /// Create an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, user_id: UserId, instrument_id: InstrumentId) -> Arc<Mutex<Position>> {
        self.positions
            .entry((user_id, instrument_id))
            .or_insert_with(|| Arc::new(Mutex::new(Position::default())))
            .clone()
    }

    fn with_position<R>(
        &self,
        user_id: UserId,
        instrument_id: InstrumentId,
        f: impl FnOnce(&mut Position) -> R,
    ) -> R {
        let handle = self.handle(user_id, instrument_id);
        let mut guard = lock_or_recover(&handle);
        f(&mut guard)
    }

    /// Current position of `(user, instrument)`.
    #[must_use]
    pub fn get(&self, user_id: UserId, instrument_id: InstrumentId) -> Position {
        self.with_position(user_id, instrument_id, |p| *p)
    }

    /// Set the absolute net-size limit for one holder.
    pub fn set_limit(&self, user_id: UserId, instrument_id: InstrumentId, limit: Quantity) {
        self.with_position(user_id, instrument_id, |p| p.limit = limit);
    }

    /// Advisory admission check: the net size the order would produce if
    /// fully executed, or a violation when it exceeds the limit.
    ///
    /// A holder's own limit takes precedence; `fallback_limit` (the
    /// instrument default) applies when none is set. Zero means
    /// unlimited in both places. The check never mutates the position.
    ///
    /// # Errors
    /// [`PositionLimitViolation`] when `|would_be_net| > limit`.
    pub fn check(
        &self,
        user_id: UserId,
        instrument_id: InstrumentId,
        quantity: Quantity,
        side: Side,
        fallback_limit: Quantity,
    ) -> Result<Quantity, PositionLimitViolation> {
        self.with_position(user_id, instrument_id, |p| {
            let delta = match side {
                Side::Buy => quantity,
                Side::Sell => -quantity,
            };
            let limit = if p.limit > 0 { p.limit } else { fallback_limit };
            let would_be = p.net_size + delta;
            if limit > 0 && would_be.abs() > limit {
                Err(PositionLimitViolation {
                    would_be_net: would_be,
                    limit,
                })
            } else {
                Ok(would_be)
            }
        })
    }

    /// Apply one executed fill.
    ///
    /// Entry-price rules: weighted average on increasing exposure,
    /// preserved on reduction, reset when flat, set to the fill price
    /// when the position flips through zero.
    pub fn apply_fill(
        &self,
        user_id: UserId,
        instrument_id: InstrumentId,
        quantity: Quantity,
        side: Side,
        price: Price,
    ) -> FillOutcome {
        let outcome = self.with_position(user_id, instrument_id, |p| {
            let previous_net = p.net_size;
            let entry_before = p.entry_price;
            let delta = match side {
                Side::Buy => quantity,
                Side::Sell => -quantity,
            };
            let new_net = previous_net + delta;
            let reduced = if previous_net.signum() * delta.signum() < 0 {
                previous_net.abs().min(delta.abs())
            } else {
                0
            };
            let flipped = previous_net != 0 && new_net != 0 && previous_net.signum() != new_net.signum();

            if flipped {
                p.entry_price = price;
            } else if new_net == 0 {
                p.entry_price = 0;
            } else if previous_net == 0 {
                p.entry_price = price;
            } else if reduced == 0 {
                // Exposure grew in the same direction: weighted average
                // entry in the 128-bit domain.
                let prev_abs = previous_net.abs() as i128;
                let add_abs = delta.abs() as i128;
                let weighted = (p.entry_price as i128 * prev_abs + price as i128 * add_abs)
                    / (prev_abs + add_abs);
                p.entry_price = weighted as i64;
            }
            p.net_size = new_net;

            FillOutcome {
                previous_net,
                new_net,
                reduced,
                entry_before,
                flipped,
            }
        });

        self.index_update(user_id, instrument_id, outcome.new_net);
        outcome
    }

    /// Overwrite one position (snapshot restore).
    pub fn restore_position(&self, row: &PositionDump) {
        self.with_position(row.user_id, row.instrument_id, |p| {
            p.net_size = row.net_size;
            p.entry_price = row.entry_price;
            p.limit = row.limit;
        });
        self.index_update(row.user_id, row.instrument_id, row.net_size);
    }

    /// Users holding non-zero positions on `instrument_id`, ascending.
    #[must_use]
    pub fn holders(&self, instrument_id: InstrumentId) -> Vec<UserId> {
        self.holders
            .get(&instrument_id)
            .map(|set| lock_or_recover(set.value()).iter().copied().collect())
            .unwrap_or_default()
    }

    /// All positions ordered by (user, instrument), for snapshots and
    /// digests. Flat positions with no explicit limit are omitted.
    #[must_use]
    pub fn dump(&self) -> Vec<PositionDump> {
        let mut rows: Vec<PositionDump> = self
            .positions
            .iter()
            .filter_map(|entry| {
                let (user_id, instrument_id) = *entry.key();
                let p = lock_or_recover(entry.value());
                if p.net_size == 0 && p.limit == 0 {
                    return None;
                }
                Some(PositionDump {
                    user_id,
                    instrument_id,
                    net_size: p.net_size,
                    entry_price: p.entry_price,
                    limit: p.limit,
                })
            })
            .collect();
        rows.sort_by_key(|r| (r.user_id, r.instrument_id));
        rows
    }

    /// Replace contents from a snapshot dump.
    pub fn restore(&self, rows: &[PositionDump]) {
        self.positions.clear();
        self.holders.clear();
        for row in rows {
            self.restore_position(row);
        }
    }

    fn index_update(&self, user_id: UserId, instrument_id: InstrumentId, net: Quantity) {
        let set = self
            .holders
            .entry(instrument_id)
            .or_insert_with(|| Mutex::new(BTreeSet::new()));
        let mut guard = lock_or_recover(set.value());
        if net == 0 {
            guard.remove(&user_id);
        } else {
            guard.insert(user_id);
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
