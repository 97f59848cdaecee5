//! Immutable configuration passed into component constructors.
//!
//! There is no global configuration singleton: the controller receives a
//! [`CoreConfig`] at construction and hands each component the slice it
//! needs. The structs deserialize from JSON so the CLI harness can load
//! them from a file.

use crate::calc::{InstrumentId, PRICE_SCALE, Price, QTY_SCALE, Quantity};
use crate::engine::types::SelfTradePolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Per-instrument trading parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Instrument identifier; one matching thread per instrument.
    pub instrument_id: InstrumentId,
    /// Human-readable symbol, e.g. `BTC-USD-PERP`.
    pub symbol: String,
    /// Minimum price increment; prices must be exact multiples.
    #[serde(default = "default_tick_size")]
    pub tick_size: Price,
    /// Minimum quantity increment; quantities must be exact multiples.
    #[serde(default = "default_qty_step")]
    pub qty_step: Quantity,
    /// Minimum accepted price.
    #[serde(default = "default_min_price")]
    pub min_price: Price,
    /// Maximum accepted price.
    #[serde(default = "default_max_price")]
    pub max_price: Price,
    /// Minimum accepted quantity.
    #[serde(default = "default_min_quantity")]
    pub min_quantity: Quantity,
    /// Maximum accepted quantity.
    #[serde(default = "default_max_quantity")]
    pub max_quantity: Quantity,
    /// Leverage in basis points (10x = 100_000).
    #[serde(default = "default_leverage_bps")]
    pub leverage_bps: i64,
    /// Maintenance margin in basis points.
    #[serde(default = "default_maint_margin_bps")]
    pub maint_margin_bps: u32,
    /// Risk ratio (bps) at or above which a position is liquidatable.
    #[serde(default = "default_liquidation_threshold_bps")]
    pub liquidation_threshold_bps: i64,
    /// Self-trade handling for this instrument.
    #[serde(default)]
    pub self_trade: SelfTradePolicy,
    /// Default absolute net-position limit; zero disables the limit.
    #[serde(default)]
    pub default_position_limit: Quantity,
}

fn default_tick_size() -> Price {
    PRICE_SCALE // 1.0
}

fn default_qty_step() -> Quantity {
    QTY_SCALE / 1_000 // 0.001
}

fn default_min_price() -> Price {
    PRICE_SCALE / 10_000 // 0.0001
}

fn default_max_price() -> Price {
    1_000_000 * PRICE_SCALE
}

fn default_min_quantity() -> Quantity {
    QTY_SCALE / 1_000 // 0.001
}

fn default_max_quantity() -> Quantity {
    1_000_000 * QTY_SCALE
}

fn default_leverage_bps() -> i64 {
    100_000 // 10x
}

fn default_maint_margin_bps() -> u32 {
    50 // 0.5%
}

fn default_liquidation_threshold_bps() -> i64 {
    10_000 // maintenance margin >= available
}

impl InstrumentConfig {
    /// A config with library defaults for the given instrument.
    #[must_use]
    pub fn with_defaults(instrument_id: InstrumentId, symbol: &str) -> Self {
        Self {
            instrument_id,
            symbol: symbol.to_string(),
            tick_size: default_tick_size(),
            qty_step: default_qty_step(),
            min_price: default_min_price(),
            max_price: default_max_price(),
            min_quantity: default_min_quantity(),
            max_quantity: default_max_quantity(),
            leverage_bps: default_leverage_bps(),
            maint_margin_bps: default_maint_margin_bps(),
            liquidation_threshold_bps: default_liquidation_threshold_bps(),
            self_trade: SelfTradePolicy::Allow,
            default_position_limit: 0,
        }
    }
}

/// Write-ahead log knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalSettings {
    /// Pre-allocated segment size in bytes.
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    /// Group-commit interval in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Pending-record count that forces an early group commit.
    #[serde(default = "default_flush_batch")]
    pub flush_batch: usize,
    /// Capacity of the group-commit queue; a full queue surfaces
    /// back-pressure instead of dropping records.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_segment_size() -> usize {
    64 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    10
}

fn default_flush_batch() -> usize {
    100
}

fn default_queue_capacity() -> usize {
    8_192
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_batch: default_flush_batch(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Admission rate-limit knobs (token buckets, integer arithmetic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Global orders per second across all users.
    #[serde(default = "default_global_rate")]
    pub global_orders_per_second: u64,
    /// Global burst size.
    #[serde(default = "default_global_burst")]
    pub global_burst: u64,
    /// Per-user orders per second.
    #[serde(default = "default_user_rate")]
    pub per_user_orders_per_second: u64,
    /// Per-user burst size.
    #[serde(default = "default_user_burst")]
    pub per_user_burst: u64,
}

fn default_global_rate() -> u64 {
    100_000
}

fn default_global_burst() -> u64 {
    200_000
}

fn default_user_rate() -> u64 {
    10_000
}

fn default_user_burst() -> u64 {
    20_000
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            global_orders_per_second: default_global_rate(),
            global_burst: default_global_burst(),
            per_user_orders_per_second: default_user_rate(),
            per_user_burst: default_user_burst(),
        }
    }
}

/// Funding scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSettings {
    /// Settlement interval in seconds (default 8 hours).
    #[serde(default = "default_funding_interval_secs")]
    pub interval_secs: i64,
    /// Interest rate component in basis points.
    #[serde(default = "default_interest_rate_bps")]
    pub interest_rate_bps: i64,
}

fn default_funding_interval_secs() -> i64 {
    8 * 3_600
}

fn default_interest_rate_bps() -> i64 {
    1 // 0.01%
}

impl Default for FundingSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_funding_interval_secs(),
            interest_rate_bps: default_interest_rate_bps(),
        }
    }
}

/// Top-level configuration for one core instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Root of the persisted state layout (`wal/`, `snapshots/`,
    /// `committed_hwm`).
    pub data_dir: PathBuf,
    /// Instruments served by this instance.
    pub instruments: Vec<InstrumentConfig>,
    /// Write-ahead log knobs.
    #[serde(default)]
    pub wal: WalSettings,
    /// Admission rate limits.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Funding scheduler knobs.
    #[serde(default)]
    pub funding: FundingSettings,
    /// Depth of each per-instrument command queue.
    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,
}

fn default_command_queue_depth() -> usize {
    4_096
}

impl CoreConfig {
    /// A single-instrument config rooted at `data_dir`, for tests and
    /// the demo harness.
    #[must_use]
    pub fn single_instrument(data_dir: PathBuf, instrument: InstrumentConfig) -> Self {
        Self {
            data_dir,
            instruments: vec![instrument],
            wal: WalSettings::default(),
            rate_limit: RateLimitSettings::default(),
            funding: FundingSettings::default(),
            command_queue_depth: default_command_queue_depth(),
        }
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    /// Returns a description of the I/O or parse failure.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
        serde_json::from_str(&raw).map_err(|e| format!("cannot parse config: {e}"))
    }

    /// Look up an instrument's configuration.
    #[must_use]
    pub fn instrument(&self, instrument_id: InstrumentId) -> Option<&InstrumentConfig> {
        self.instruments
            .iter()
            .find(|i| i.instrument_id == instrument_id)
    }
}
