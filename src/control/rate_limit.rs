//! Token-bucket admission rate limiting.
//!
//! A global bucket bounds the instance's total order rate; per-user
//! buckets bound each user's. Tokens are micro-tokens in integer
//! arithmetic (no floating-point state), refilled from a monotonic
//! clock. Liquidation takers bypass the limiter entirely.

use crate::calc::UserId;
use crate::control::config::RateLimitSettings;
use dashmap::DashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Micro-tokens per order.
const TOKEN: u64 = 1_000_000;

#[derive(Debug)]
struct TokenBucket {
    tokens_micro: u64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(burst: u64) -> Self {
        Self {
            tokens_micro: burst.saturating_mul(TOKEN),
            last_refill: Instant::now(),
        }
    }

    /// Refill by elapsed time, then try to take one token.
    ///
    /// `rate` is orders per second; micro-tokens per nanosecond are
    /// `rate / 1_000`, so `add = elapsed_ns * rate / 1_000`.
    fn consume(&mut self, rate: u64, burst: u64) -> bool {
        let now = Instant::now();
        let elapsed_ns = now.duration_since(self.last_refill).as_nanos() as u64;
        self.last_refill = now;
        let added = elapsed_ns.saturating_mul(rate) / 1_000;
        self.tokens_micro = self
            .tokens_micro
            .saturating_add(added)
            .min(burst.saturating_mul(TOKEN));
        if self.tokens_micro >= TOKEN {
            self.tokens_micro -= TOKEN;
            true
        } else {
            false
        }
    }
}

/// Global-plus-per-user admission limiter.
#[derive(Debug)]
pub struct RateLimiter {
    global_rate: u64,
    global_burst: u64,
    user_rate: u64,
    user_burst: u64,
    global: Mutex<TokenBucket>,
    users: DashMap<UserId, Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Build from settings.
    #[must_use]
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            global_rate: settings.global_orders_per_second,
            global_burst: settings.global_burst,
            user_rate: settings.per_user_orders_per_second,
            user_burst: settings.per_user_burst,
            global: Mutex::new(TokenBucket::full(settings.global_burst)),
            users: DashMap::new(),
        }
    }

    /// Whether `user_id` may submit one more order now.
    pub fn allow(&self, user_id: UserId) -> bool {
        if !lock_or_recover(&self.global).consume(self.global_rate, self.global_burst) {
            return false;
        }
        let bucket = self
            .users
            .entry(user_id)
            .or_insert_with(|| Mutex::new(TokenBucket::full(self.user_burst)));
        let allowed = lock_or_recover(bucket.value()).consume(self.user_rate, self.user_burst);
        allowed
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
