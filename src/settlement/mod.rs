//! Rating updates and post-match settlement

pub mod elo;
pub mod engine;

pub use elo::{EloCalculator, RatedPlayer};
pub use engine::{
    CancellationReport, ForcedResult, SettlementEngine, SettlementOutcome, SettlementReport,
    WagerPayoutSummary,
};
