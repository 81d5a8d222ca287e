//! Wager records, their state union and ledger transaction rows

use crate::error::{MatchmakingError, Result};
use crate::types::{MatchId, UserId, WagerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Basis-point denominator for the platform fee
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Identity recorded as `settled_by` when a match result settles a wager
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WagerStatus {
    Waiting,
    Locked,
    Live,
    Finished,
    Cancelled,
    Disputed,
}

impl WagerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WagerStatus::Waiting => "WAITING",
            WagerStatus::Locked => "LOCKED",
            WagerStatus::Live => "LIVE",
            WagerStatus::Finished => "FINISHED",
            WagerStatus::Cancelled => "CANCELLED",
            WagerStatus::Disputed => "DISPUTED",
        }
    }
}

impl std::fmt::Display for WagerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Funds one side has in escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stake {
    pub user_id: UserId,
    pub locked: u64,
}

/// Payout of a finished wager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub winner_id: UserId,
    pub loser_id: UserId,
    pub platform_fee: u64,
    pub winner_prize: u64,
    pub settled_at: DateTime<Utc>,
    pub settled_by: UserId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelKind {
    /// Creator took back an unaccepted wager
    Withdrawn,
    /// Stakes returned after a cancelled match or by an operator
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WagerState {
    Waiting,
    Locked,
    Live,
    Finished(Payout),
    Cancelled {
        kind: CancelKind,
        at: DateTime<Utc>,
        by: UserId,
    },
    /// Stakes stay in escrow until an operator resolves the dispute
    Disputed {
        at: DateTime<Utc>,
        by: UserId,
        reason: String,
    },
}

impl WagerState {
    pub fn status(&self) -> WagerStatus {
        match self {
            WagerState::Waiting => WagerStatus::Waiting,
            WagerState::Locked => WagerStatus::Locked,
            WagerState::Live => WagerStatus::Live,
            WagerState::Finished(_) => WagerStatus::Finished,
            WagerState::Cancelled { .. } => WagerStatus::Cancelled,
            WagerState::Disputed { .. } => WagerStatus::Disputed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WagerState::Finished(_) | WagerState::Cancelled { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wager {
    pub id: WagerId,
    pub creator: Stake,
    pub opponent: Option<Stake>,
    /// Stake required from each side
    pub amount: u64,
    pub apply_fee: bool,
    pub match_id: Option<MatchId>,
    pub state: WagerState,
    pub created_at: DateTime<Utc>,
}

impl Wager {
    pub fn status(&self) -> WagerStatus {
        self.state.status()
    }

    /// Everything currently held in escrow
    pub fn total_pot(&self) -> u64 {
        self.creator.locked + self.opponent.as_ref().map(|o| o.locked).unwrap_or(0)
    }

    pub fn opponent_id(&self) -> Option<&str> {
        self.opponent.as_ref().map(|o| o.user_id.as_str())
    }

    pub fn is_party(&self, user_id: &str) -> bool {
        self.creator.user_id == user_id || self.opponent_id() == Some(user_id)
    }

    /// The other side of a fully-locked wager
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        let opponent = self.opponent_id()?;
        if self.creator.user_id == user_id {
            Some(opponent)
        } else if opponent == user_id {
            Some(self.creator.user_id.as_str())
        } else {
            None
        }
    }

    pub fn wrong_status(&self, expected: &str) -> MatchmakingError {
        MatchmakingError::InvalidWager {
            reason: format!(
                "wager {} is {}, expected {}",
                self.id,
                self.status(),
                expected
            ),
        }
    }

    /// `(fee, prize)` for the current pot. The two always add up to the pot.
    pub fn payout_split(&self, fee_bps: u64) -> Result<(u64, u64)> {
        let pot = self.total_pot();
        let fee = if self.apply_fee {
            (u128::from(pot) * u128::from(fee_bps) / u128::from(BPS_DENOMINATOR)) as u64
        } else {
            0
        };
        let prize = pot
            .checked_sub(fee)
            .ok_or_else(|| MatchmakingError::FinancialInvariant {
                reason: format!("fee {} exceeds pot {}", fee, pot),
            })?;
        Ok((fee, prize))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Lock,
    Unlock,
    Refund,
    Win,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Lock => "LOCK",
            TransactionKind::Unlock => "UNLOCK",
            TransactionKind::Refund => "REFUND",
            TransactionKind::Win => "WIN",
        }
    }
}

/// Append-only ledger row. `balance_after - balance_before` equals the signed
/// amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WagerTransaction {
    pub id: Uuid,
    pub wager_id: WagerId,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: u64,
    pub balance_before: u64,
    pub balance_after: u64,
    pub created_at: DateTime<Utc>,
}

impl WagerTransaction {
    pub fn signed_amount(&self) -> i128 {
        match self.kind {
            TransactionKind::Lock => -i128::from(self.amount),
            TransactionKind::Unlock | TransactionKind::Refund | TransactionKind::Win => {
                i128::from(self.amount)
            }
        }
    }
}

/// Platform revenue summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueStats {
    pub total_fees: u64,
    pub settled_volume: u64,
    pub settled_wagers: u64,
    pub open_wagers: u64,
    pub cancelled_wagers: u64,
    pub disputed_wagers: u64,
}

/// Result of replaying one user's transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAudit {
    pub user_id: UserId,
    pub transactions: usize,
    pub net_change: i128,
    pub opening_balance: u64,
    pub balance: u64,
}
