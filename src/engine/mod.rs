//! Order book and matching engine for one instrument.

mod book;
mod error;
mod level;
mod matching;
pub mod types;

pub use book::{MatchOutcome, OrderBook};
pub use error::EngineError;
pub use level::PriceLevel;
pub use matching::{CancelReport, Fill, MatchingEngine, ProcessOutput, reject_code};
