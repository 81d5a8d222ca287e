//! Trust score derivation and queue eligibility
//!
//! The score is a pure function of account signals. The eligibility gate only
//! reads; writing the derived score back is [`TrustService::refresh`].

use crate::error::Result;
use crate::users::{SteamSignals, User, UserStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const BASE_TRUST: i64 = 1000;
pub const VERIFIED_MIN_TRUST: u32 = 1200;
pub const VERIFIED_MIN_HOURS: u32 = 500;
pub const QUEUE_MIN_TRUST: u32 = 500;

/// `1000 + 10*floor(hours/100) + 50*floor(years) - 500*vac - 200*game - 100*reports`,
/// floored at 0.
pub fn compute_trust_score(signals: &SteamSignals, validated_reports: u32) -> u32 {
    let score = BASE_TRUST + 10 * i64::from(signals.hours / 100)
        + 50 * signals.account_age_years.max(0.0).floor() as i64
        - 500 * i64::from(signals.vac_bans)
        - 200 * i64::from(signals.game_bans)
        - 100 * i64::from(validated_reports);
    score.clamp(0, i64::from(u32::MAX)) as u32
}

pub fn is_verified(trust_score: u32, hours: u32) -> bool {
    trust_score >= VERIFIED_MIN_TRUST && hours >= VERIFIED_MIN_HOURS
}

/// Why a user may not queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenialReason {
    Banned,
    VacBanned,
    TrustTooLow { score: u32 },
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenialReason::Banned => write!(f, "Account is banned"),
            DenialReason::VacBanned => write!(f, "VAC ban on record"),
            DenialReason::TrustTooLow { score } => {
                write!(f, "Trust Factor too low ({} < {})", score, QUEUE_MIN_TRUST)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Eligibility {
    Allowed,
    Denied(DenialReason),
}

/// Advisory gate for queue admission; never mutates.
pub fn check_queue_eligibility(user: &User) -> Eligibility {
    if user.is_banned {
        Eligibility::Denied(DenialReason::Banned)
    } else if user.steam.vac_bans > 0 {
        Eligibility::Denied(DenialReason::VacBanned)
    } else if user.trust_score < QUEUE_MIN_TRUST {
        Eligibility::Denied(DenialReason::TrustTooLow {
            score: user.trust_score,
        })
    } else {
        Eligibility::Allowed
    }
}

/// Writes freshly derived trust scores back to the user store
#[derive(Clone)]
pub struct TrustService {
    users: Arc<dyn UserStore>,
}

impl TrustService {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    /// Re-derive and store the trust score of one user
    pub fn refresh(&self, user_id: &str) -> Result<u32> {
        let updated = self.users.update(user_id, &mut |user| {
            user.trust_score = compute_trust_score(&user.steam, user.validated_reports);
            Ok(())
        })?;
        debug!("Trust score for {} is now {}", user_id, updated.trust_score);
        Ok(updated.trust_score)
    }

    /// Refresh a batch of users, logging but skipping individual failures
    pub fn refresh_all(&self, user_ids: &[String]) -> usize {
        user_ids
            .iter()
            .filter(|id| match self.refresh(id) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Failed to refresh trust score for {}: {}", id, e);
                    false
                }
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::InMemoryUserStore;

    fn signals(hours: u32, years: f64, vac: u32, game: u32) -> SteamSignals {
        SteamSignals {
            hours,
            account_age_years: years,
            vac_bans: vac,
            game_bans: game,
        }
    }

    #[test]
    fn test_trust_formula() {
        assert_eq!(compute_trust_score(&signals(0, 0.0, 0, 0), 0), 1000);
        // 1000 + 10*12 + 50*3
        assert_eq!(compute_trust_score(&signals(1250, 3.9, 0, 0), 0), 1270);
        // 1000 + 10*5 + 50*1 - 200 - 100*2
        assert_eq!(compute_trust_score(&signals(560, 1.2, 0, 1), 2), 700);
    }

    #[test]
    fn test_trust_floored_at_zero() {
        assert_eq!(compute_trust_score(&signals(0, 0.0, 3, 0), 0), 0);
    }

    #[test]
    fn test_verified_requires_both() {
        assert!(is_verified(1200, 500));
        assert!(!is_verified(1199, 5000));
        assert!(!is_verified(1500, 499));
    }

    #[test]
    fn test_eligibility_reasons() {
        let mut user = User::new("u1", 1000);
        assert_eq!(check_queue_eligibility(&user), Eligibility::Allowed);

        user.trust_score = 499;
        assert_eq!(
            check_queue_eligibility(&user),
            Eligibility::Denied(DenialReason::TrustTooLow { score: 499 })
        );

        user.steam.vac_bans = 1;
        assert_eq!(
            check_queue_eligibility(&user),
            Eligibility::Denied(DenialReason::VacBanned)
        );

        user.is_banned = true;
        assert_eq!(
            check_queue_eligibility(&user),
            Eligibility::Denied(DenialReason::Banned)
        );
    }

    #[test]
    fn test_refresh_writes_score() {
        let store = Arc::new(InMemoryUserStore::new());
        let mut user = User::new("u1", 1000).with_steam("s1", signals(300, 2.0, 0, 0));
        user.validated_reports = 1;
        store.insert(user).unwrap();

        let service = TrustService::new(store.clone());
        assert_eq!(service.refresh("u1").unwrap(), 1030);
        assert_eq!(store.get("u1").unwrap().unwrap().trust_score, 1030);
        assert_eq!(service.refresh_all(&["u1".to_string(), "ghost".to_string()]), 1);
    }
}
