//! Risk subsystems that consume positions and marks: liquidation and
//! funding.

mod funding;
mod liquidation;

pub use funding::{
    FundingConfig, FundingDump, FundingRateRecord, FundingScheduler, FundingSettlement,
};
pub use liquidation::{LiquidationEvaluator, RiskAssessment};
