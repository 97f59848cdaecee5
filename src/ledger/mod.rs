//! Per-user account ledger: balance, frozen amount and used margin.
//!
//! Every mutation runs inside a per-user critical section; an operation
//! that touches two users acquires both locks in ascending user id. No
//! operation ever spans more than two users.

pub mod position;

use crate::calc::UserId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{trace, warn};

/// Ledger entry that absorbs shortfalls from liquidations and funding.
pub const INSURANCE_FUND_ACCOUNT: UserId = 0;

/// One user's balances, all in scaled integer monetary units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Total balance.
    pub balance: i64,
    /// Portion of the balance frozen against open orders.
    pub frozen: i64,
    /// Margin carried by open positions.
    pub used_margin: i64,
}

impl Account {
    /// Spendable balance: `balance - frozen`. Non-negative at rest.
    #[inline]
    #[must_use]
    pub fn available(&self) -> i64 {
        self.balance - self.frozen
    }
}

/// Read-only view of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    /// Total balance.
    pub balance: i64,
    /// Frozen against open orders.
    pub frozen: i64,
    /// `balance - frozen`.
    pub available: i64,
    /// Margin carried by open positions.
    pub used_margin: i64,
}

/// Snapshot row for one account, ordered by user id in dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDump {
    /// The account's user id.
    pub user_id: UserId,
    /// Total balance.
    pub balance: i64,
    /// Frozen against open orders.
    pub frozen: i64,
    /// Margin carried by open positions.
    pub used_margin: i64,
}

/// The account ledger: a per-user map of [`Account`] records, each
/// behind its own lock.
#[derive(Debug, Default)]
pub struct AccountLedger {
    accounts: DashMap<UserId, Arc<Mutex<Account>>>,
}

impl AccountLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, user_id: UserId) -> Arc<Mutex<Account>> {
        self.accounts
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(Account::default())))
            .clone()
    }

    /// Run `f` under the user's lock.
    fn with_account<R>(&self, user_id: UserId, f: impl FnOnce(&mut Account) -> R) -> R {
        let handle = self.handle(user_id);
        let mut guard = lock_or_recover(&handle);
        f(&mut guard)
    }

    /// Run `f` under both users' locks, acquired in ascending user id.
    pub fn with_pair<R>(
        &self,
        a: UserId,
        b: UserId,
        f: impl FnOnce(&mut Account, &mut Account) -> R,
    ) -> Option<R> {
        if a == b {
            return None;
        }
        let (first_id, second_id) = if a < b { (a, b) } else { (b, a) };
        let first_handle = self.handle(first_id);
        let second_handle = self.handle(second_id);
        let mut first = lock_or_recover(&first_handle);
        let mut second = lock_or_recover(&second_handle);
        Some(if a < b {
            f(&mut first, &mut second)
        } else {
            f(&mut second, &mut first)
        })
    }

    /// Total balance of `user_id` (zero for unknown users).
    #[must_use]
    pub fn balance(&self, user_id: UserId) -> i64 {
        self.with_account(user_id, |a| a.balance)
    }

    /// Spendable balance of `user_id`.
    #[must_use]
    pub fn available(&self, user_id: UserId) -> i64 {
        self.with_account(user_id, |a| a.available())
    }

    /// Freeze `amount` against an open order. Succeeds iff
    /// `available >= amount`.
    pub fn freeze(&self, user_id: UserId, amount: i64) -> bool {
        if amount < 0 {
            return false;
        }
        self.with_account(user_id, |a| {
            if a.available() >= amount {
                a.frozen += amount;
                trace!("ledger: froze {amount} for user {user_id}");
                true
            } else {
                false
            }
        })
    }

    /// Release a freeze. Saturates at zero so a duplicate release cannot
    /// drive `frozen` negative.
    pub fn unfreeze(&self, user_id: UserId, amount: i64) {
        if amount <= 0 {
            return;
        }
        self.with_account(user_id, |a| {
            a.frozen = (a.frozen - amount).max(0);
        });
    }

    /// Apply a signed balance delta. Succeeds iff the balance stays
    /// non-negative.
    pub fn adjust(&self, user_id: UserId, delta: i64) -> bool {
        self.with_account(user_id, |a| {
            let next = a.balance + delta;
            if next < 0 {
                false
            } else {
                a.balance = next;
                true
            }
        })
    }

    /// Move margin frozen for an order into the margin carried by the
    /// resulting position.
    pub fn fill_margin(&self, user_id: UserId, amount: i64) {
        if amount <= 0 {
            return;
        }
        self.with_account(user_id, |a| {
            let moved = amount.min(a.frozen);
            a.frozen -= moved;
            a.used_margin += moved;
        });
    }

    /// Release margin carried by a reduced position. Saturates at zero.
    pub fn release_margin(&self, user_id: UserId, amount: i64) {
        if amount <= 0 {
            return;
        }
        self.with_account(user_id, |a| {
            a.used_margin = (a.used_margin - amount).max(0);
        });
    }

    /// Apply a signed delta, drawing any shortfall from the insurance
    /// fund so the user's balance never goes negative. Returns the
    /// amount drawn.
    ///
    /// Used for realized losses, funding payments and liquidation
    /// settlement; replay applies recorded deltas through this same rule.
    pub fn settle_with_insurance(&self, user_id: UserId, delta: i64) -> i64 {
        if delta >= 0 {
            self.with_account(user_id, |a| {
                a.balance += delta;
            });
            return 0;
        }
        if user_id == INSURANCE_FUND_ACCOUNT {
            // The fund itself absorbs its own losses; it may go negative
            // and that is surfaced to operators, not hidden.
            self.with_account(user_id, |a| {
                a.balance += delta;
            });
            return 0;
        }
        let draw = self
            .with_pair(user_id, INSURANCE_FUND_ACCOUNT, |user, fund| {
                let next = user.balance + delta;
                if next >= 0 {
                    user.balance = next;
                    0
                } else {
                    let shortfall = -next;
                    user.balance = 0;
                    fund.balance -= shortfall;
                    shortfall
                }
            })
            .unwrap_or(0);
        if draw > 0 {
            warn!("ledger: insurance fund drew {draw} covering user {user_id}");
        }
        draw
    }

    /// Read-only stats for one user.
    #[must_use]
    pub fn snapshot(&self, user_id: UserId) -> AccountStats {
        self.with_account(user_id, |a| AccountStats {
            balance: a.balance,
            frozen: a.frozen,
            available: a.available(),
            used_margin: a.used_margin,
        })
    }

    /// All accounts ordered by user id, for snapshots and digests.
    #[must_use]
    pub fn dump(&self) -> Vec<AccountDump> {
        let mut rows: Vec<AccountDump> = self
            .accounts
            .iter()
            .map(|entry| {
                let account = lock_or_recover(entry.value());
                AccountDump {
                    user_id: *entry.key(),
                    balance: account.balance,
                    frozen: account.frozen,
                    used_margin: account.used_margin,
                }
            })
            .collect();
        rows.sort_by_key(|r| r.user_id);
        rows
    }

    /// Replace the ledger contents from a snapshot dump.
    pub fn restore(&self, rows: &[AccountDump]) {
        self.accounts.clear();
        for row in rows {
            self.accounts.insert(
                row.user_id,
                Arc::new(Mutex::new(Account {
                    balance: row.balance,
                    frozen: row.frozen,
                    used_margin: row.used_margin,
                })),
            );
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
