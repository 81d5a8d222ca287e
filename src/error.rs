//! Error types for the match lifecycle engine
//!
//! Domain operations return [`MatchmakingError`] so callers can match on the
//! exact failure. The service layer wraps these in `anyhow` where it only
//! needs to log and exit.

use crate::types::{MatchId, UserId, WagerId};

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MatchmakingError>;

/// Broad class of an error, used for metrics labels and for deciding what
/// can be shown to the player verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Precondition,
    External,
    Financial,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Precondition => "precondition",
            ErrorCategory::External => "external",
            ErrorCategory::Financial => "financial",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MatchmakingError {
    #[error("User not found: {user_id}")]
    UserNotFound { user_id: UserId },

    #[error("Account {user_id} is banned")]
    Banned { user_id: UserId },

    #[error("Steam ID required: {user_id} has no linked game account")]
    MissingLinkedIdentity { user_id: UserId },

    #[error("Not eligible for matchmaking: {reason}")]
    NotEligible { reason: String },

    #[error("User {user_id} is already in an active match")]
    AlreadyInActiveMatch { user_id: UserId },

    #[error("User {user_id} is already queued in another unit")]
    AlreadyQueued { user_id: UserId },

    #[error("Only the party leader can queue the party")]
    NotPartyLeader { leader_id: UserId },

    #[error("Party of {party_size} cannot queue for a team of {team_size}")]
    PartySizeMismatch { party_size: usize, team_size: usize },

    #[error("Match not found: {match_id}")]
    MatchNotFound { match_id: MatchId },

    #[error("User {user_id} is not a participant of match {match_id}")]
    NotParticipant { match_id: MatchId, user_id: UserId },

    #[error("Match {match_id} is {actual}, expected {expected}")]
    WrongMatchState {
        match_id: MatchId,
        expected: String,
        actual: String,
    },

    #[error("Confirmation window for match {match_id} has expired")]
    ConfirmationExpired { match_id: MatchId },

    #[error("Not your turn to ban")]
    NotYourTurn,

    #[error("{item} is already banned")]
    AlreadyBanned { item: String },

    #[error("{item} is not in the pool")]
    ItemNotInPool { item: String },

    #[error("Veto for this pool is already decided: {selected}")]
    PoolResolved { selected: String },

    #[error("Provisioning for match {match_id} was never started")]
    ProvisioningNotStarted { match_id: MatchId },

    #[error("Invalid pairing: {reason}")]
    InvalidPairing { reason: String },

    #[error("Invalid match outcome: {reason}")]
    InvalidOutcome { reason: String },

    #[error("Wager not found: {wager_id}")]
    WagerNotFound { wager_id: WagerId },

    #[error("Invalid wager operation: {reason}")]
    InvalidWager { reason: String },

    #[error("Insufficient balance: {required} required")]
    InsufficientBalance { required: u64 },

    #[error("Not authorized to {action}")]
    Unauthorized { action: String },

    #[error("Ledger invariant violated: {reason}")]
    FinancialInvariant { reason: String },

    #[error("Game server provider error: {message}")]
    ExternalProvider { message: String },

    #[error("Missing credentials: {message}")]
    MissingCredentials { message: String },

    #[error("Messaging failure: {message}")]
    Messaging { message: String },

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl MatchmakingError {
    /// Classify the error according to who caused it
    pub fn category(&self) -> ErrorCategory {
        match self {
            MatchmakingError::ExternalProvider { .. }
            | MatchmakingError::MissingCredentials { .. }
            | MatchmakingError::Messaging { .. } => ErrorCategory::External,
            MatchmakingError::FinancialInvariant { .. } => ErrorCategory::Financial,
            MatchmakingError::ConfigurationError { .. } | MatchmakingError::InternalError { .. } => {
                ErrorCategory::Internal
            }
            _ => ErrorCategory::Precondition,
        }
    }

    /// Whether the message can be shown to the player as-is
    pub fn is_user_facing(&self) -> bool {
        self.category() == ErrorCategory::Precondition
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        MatchmakingError::InternalError {
            message: format!("Failed to acquire {} lock", what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            MatchmakingError::NotYourTurn.category(),
            ErrorCategory::Precondition
        );
        assert!(MatchmakingError::NotYourTurn.is_user_facing());

        let provider = MatchmakingError::ExternalProvider {
            message: "502".to_string(),
        };
        assert_eq!(provider.category(), ErrorCategory::External);
        assert!(!provider.is_user_facing());

        let ledger = MatchmakingError::FinancialInvariant {
            reason: "payout exceeds pot".to_string(),
        };
        assert_eq!(ledger.category(), ErrorCategory::Financial);
    }

    #[test]
    fn test_user_facing_messages() {
        let err = MatchmakingError::MissingLinkedIdentity {
            user_id: "u1".to_string(),
        };
        assert!(err.to_string().starts_with("Steam ID required"));

        let err = MatchmakingError::NotEligible {
            reason: "Trust Factor too low".to_string(),
        };
        assert!(err.to_string().contains("Trust Factor too low"));
    }
}
