//! Peer-to-peer wagers held in escrow against a match outcome

pub mod ledger;
pub mod types;

pub use ledger::WagerLedger;
pub use types::{
    CancelKind, LedgerAudit, Payout, RevenueStats, Stake, TransactionKind, Wager, WagerState,
    WagerStatus, WagerTransaction, SYSTEM_ACTOR,
};
