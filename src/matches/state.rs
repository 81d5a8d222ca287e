//! Match aggregate and its state machine
//!
//! Each phase carries exactly the data that exists in that phase, so a match
//! in `Veto` cannot have a server and a `Configuring` match always has its map
//! and location. Every transition method checks the current phase first and
//! leaves the match untouched on error.

use crate::error::{MatchmakingError, Result};
use crate::matches::veto::VetoState;
use crate::provider::types::ServerAssignment;
use crate::types::{GameMode, MatchId, RatingChange, TeamSide, UserId, VetoKind};
use crate::utils::generate_match_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Phase name without payload, used for indexing, logging and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStateKind {
    Confirming,
    Veto,
    Configuring,
    Warmup,
    Live,
    Finished,
    Cancelled,
}

impl MatchStateKind {
    pub const ALL: [MatchStateKind; 7] = [
        MatchStateKind::Confirming,
        MatchStateKind::Veto,
        MatchStateKind::Configuring,
        MatchStateKind::Warmup,
        MatchStateKind::Live,
        MatchStateKind::Finished,
        MatchStateKind::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStateKind::Confirming => "CONFIRMING",
            MatchStateKind::Veto => "VETO",
            MatchStateKind::Configuring => "CONFIGURING",
            MatchStateKind::Warmup => "WARMUP",
            MatchStateKind::Live => "LIVE",
            MatchStateKind::Finished => "FINISHED",
            MatchStateKind::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStateKind::Finished | MatchStateKind::Cancelled)
    }
}

impl std::fmt::Display for MatchStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the veto
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSetup {
    pub map: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProvisioningStatus {
    NotStarted,
    Started { since: DateTime<Utc> },
}

/// Latest normalized view of the provider match resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveFeed {
    pub score_a: u32,
    pub score_b: u32,
    pub finished: bool,
    pub connected: BTreeSet<UserId>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancelReason {
    Declined { by: UserId },
    ConfirmationTimeout,
    PlayerAbsent { missing: Vec<UserId> },
    ProvisioningFailed { message: String },
    Operator { by: UserId },
}

impl CancelReason {
    /// Low-cardinality label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            CancelReason::Declined { .. } => "declined",
            CancelReason::ConfirmationTimeout => "confirmation_timeout",
            CancelReason::PlayerAbsent { .. } => "player_absent",
            CancelReason::ProvisioningFailed { .. } => "provisioning_failed",
            CancelReason::Operator { .. } => "operator",
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Declined { by } => write!(f, "declined by {}", by),
            CancelReason::ConfirmationTimeout => write!(f, "confirmation timeout"),
            CancelReason::PlayerAbsent { missing } => {
                write!(f, "players absent: {}", missing.join(", "))
            }
            CancelReason::ProvisioningFailed { message } => {
                write!(f, "provisioning failed: {}", message)
            }
            CancelReason::Operator { by } => write!(f, "cancelled by operator {}", by),
        }
    }
}

/// Final result of a finished match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub winner: TeamSide,
    pub mvp: Option<UserId>,
    pub score_a: u32,
    pub score_b: u32,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: i64,
    /// Set when an operator decided the outcome
    pub forced_by: Option<UserId>,
    /// Decided with the result so follow-up writes can be replayed
    #[serde(default)]
    pub rating_changes: Vec<RatingChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchPhase {
    Confirming {
        deadline: DateTime<Utc>,
        confirmed: BTreeSet<UserId>,
    },
    Veto(VetoState),
    Configuring {
        setup: MatchSetup,
        provisioning: ProvisioningStatus,
    },
    Warmup {
        setup: MatchSetup,
        server: ServerAssignment,
        deadline: DateTime<Utc>,
        feed: LiveFeed,
    },
    Live {
        setup: MatchSetup,
        server: ServerAssignment,
        started_at: DateTime<Utc>,
        feed: LiveFeed,
    },
    Finished {
        setup: MatchSetup,
        server: Option<ServerAssignment>,
        result: MatchResult,
    },
    Cancelled {
        reason: CancelReason,
        at: DateTime<Utc>,
        server: Option<ServerAssignment>,
    },
}

impl MatchPhase {
    pub fn kind(&self) -> MatchStateKind {
        match self {
            MatchPhase::Confirming { .. } => MatchStateKind::Confirming,
            MatchPhase::Veto(_) => MatchStateKind::Veto,
            MatchPhase::Configuring { .. } => MatchStateKind::Configuring,
            MatchPhase::Warmup { .. } => MatchStateKind::Warmup,
            MatchPhase::Live { .. } => MatchStateKind::Live,
            MatchPhase::Finished { .. } => MatchStateKind::Finished,
            MatchPhase::Cancelled { .. } => MatchStateKind::Cancelled,
        }
    }
}

/// Result of a confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// Recorded; still waiting on `remaining` participants
    Recorded { remaining: usize },
    /// This user had already confirmed
    AlreadyConfirmed,
    /// This was the last confirmation; the match moved to veto
    Transitioned,
}

/// Result of an accepted ban
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanOutcome {
    pub by: TeamSide,
    /// Auto-selected item when the pool is now decided
    pub selected: Option<String>,
    /// Set when both pools are decided and the match moved to configuring
    pub completed: Option<MatchSetup>,
}

/// The central match aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: MatchId,
    pub mode: GameMode,
    pub team_a: Vec<UserId>,
    pub team_b: Vec<UserId>,
    pub map_pool: Vec<String>,
    pub location_pool: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub phase: MatchPhase,
}

impl Match {
    /// New match waiting for confirmations until `deadline`
    pub fn new(
        mode: GameMode,
        team_a: Vec<UserId>,
        team_b: Vec<UserId>,
        map_pool: Vec<String>,
        location_pool: Vec<String>,
        created_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_match_id(),
            mode,
            team_a,
            team_b,
            map_pool,
            location_pool,
            created_at,
            phase: MatchPhase::Confirming {
                deadline,
                confirmed: BTreeSet::new(),
            },
        }
    }

    pub fn state(&self) -> MatchStateKind {
        self.phase.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn participants(&self) -> impl Iterator<Item = &UserId> {
        self.team_a.iter().chain(self.team_b.iter())
    }

    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants().cloned().collect()
    }

    pub fn side_of(&self, user_id: &str) -> Option<TeamSide> {
        if self.team_a.iter().any(|u| u == user_id) {
            Some(TeamSide::A)
        } else if self.team_b.iter().any(|u| u == user_id) {
            Some(TeamSide::B)
        } else {
            None
        }
    }

    pub fn team(&self, side: TeamSide) -> &[UserId] {
        match side {
            TeamSide::A => &self.team_a,
            TeamSide::B => &self.team_b,
        }
    }

    pub fn require_participant(&self, user_id: &str) -> Result<TeamSide> {
        self.side_of(user_id)
            .ok_or_else(|| MatchmakingError::NotParticipant {
                match_id: self.id,
                user_id: user_id.to_string(),
            })
    }

    pub fn wrong_state(&self, expected: &str) -> MatchmakingError {
        MatchmakingError::WrongMatchState {
            match_id: self.id,
            expected: expected.to_string(),
            actual: self.state().to_string(),
        }
    }

    pub fn setup(&self) -> Option<&MatchSetup> {
        match &self.phase {
            MatchPhase::Configuring { setup, .. }
            | MatchPhase::Warmup { setup, .. }
            | MatchPhase::Live { setup, .. }
            | MatchPhase::Finished { setup, .. } => Some(setup),
            _ => None,
        }
    }

    pub fn server(&self) -> Option<&ServerAssignment> {
        match &self.phase {
            MatchPhase::Warmup { server, .. } | MatchPhase::Live { server, .. } => Some(server),
            MatchPhase::Finished { server, .. } | MatchPhase::Cancelled { server, .. } => {
                server.as_ref()
            }
            _ => None,
        }
    }

    pub fn feed(&self) -> Option<&LiveFeed> {
        match &self.phase {
            MatchPhase::Warmup { feed, .. } | MatchPhase::Live { feed, .. } => Some(feed),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&MatchResult> {
        match &self.phase {
            MatchPhase::Finished { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Record a participant's acceptance
    pub fn confirm(&mut self, user_id: &str, now: DateTime<Utc>) -> Result<ConfirmOutcome> {
        self.require_participant(user_id)?;
        let expected = self.team_a.len() + self.team_b.len();

        let (map_pool, location_pool) = (self.map_pool.clone(), self.location_pool.clone());
        match &mut self.phase {
            MatchPhase::Confirming {
                deadline,
                confirmed,
            } => {
                if confirmed.contains(user_id) {
                    return Ok(ConfirmOutcome::AlreadyConfirmed);
                }
                if now > *deadline {
                    return Err(MatchmakingError::ConfirmationExpired { match_id: self.id });
                }
                confirmed.insert(user_id.to_string());
                if confirmed.len() < expected {
                    return Ok(ConfirmOutcome::Recorded {
                        remaining: expected - confirmed.len(),
                    });
                }
                self.phase = MatchPhase::Veto(VetoState::new(map_pool, location_pool));
                Ok(ConfirmOutcome::Transitioned)
            }
            MatchPhase::Cancelled { .. } => Err(self.wrong_state("CONFIRMING")),
            // everyone confirmed already
            _ => Ok(ConfirmOutcome::AlreadyConfirmed),
        }
    }

    /// A participant refuses the match; it is cancelled at once
    pub fn decline(&mut self, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.require_participant(user_id)?;
        if self.state() != MatchStateKind::Confirming {
            return Err(self.wrong_state("CONFIRMING"));
        }
        self.phase = MatchPhase::Cancelled {
            reason: CancelReason::Declined {
                by: user_id.to_string(),
            },
            at: now,
            server: None,
        };
        Ok(())
    }

    /// Cancel a confirming match whose deadline has passed. Returns whether
    /// the match was cancelled.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        match &self.phase {
            MatchPhase::Confirming { deadline, .. } if now > *deadline => {
                self.phase = MatchPhase::Cancelled {
                    reason: CancelReason::ConfirmationTimeout,
                    at: now,
                    server: None,
                };
                true
            }
            _ => false,
        }
    }

    /// Apply one veto ban from `user_id`
    pub fn ban(&mut self, user_id: &str, kind: VetoKind, item: &str) -> Result<BanOutcome> {
        let veto = match &mut self.phase {
            MatchPhase::Veto(veto) => veto,
            _ => return Err(self.wrong_state("VETO")),
        };
        let side = match self.team_a.iter().any(|u| u == user_id) {
            true => TeamSide::A,
            false if self.team_b.iter().any(|u| u == user_id) => TeamSide::B,
            false => {
                return Err(MatchmakingError::NotParticipant {
                    match_id: self.id,
                    user_id: user_id.to_string(),
                })
            }
        };

        let selected = veto.pool_mut(kind).ban(item, side)?;
        let completed = veto
            .resolved()
            .map(|(map, location)| MatchSetup { map, location });
        if let Some(setup) = &completed {
            self.phase = MatchPhase::Configuring {
                setup: setup.clone(),
                provisioning: ProvisioningStatus::NotStarted,
            };
        }

        Ok(BanOutcome {
            by: side,
            selected,
            completed,
        })
    }

    /// Move a warming-up match to live
    pub fn go_live(&mut self, now: DateTime<Utc>) -> Result<()> {
        let next = match &self.phase {
            MatchPhase::Warmup {
                setup,
                server,
                feed,
                ..
            } => MatchPhase::Live {
                setup: setup.clone(),
                server: server.clone(),
                started_at: now,
                feed: feed.clone(),
            },
            _ => return Err(self.wrong_state("WARMUP")),
        };
        self.phase = next;
        Ok(())
    }

    /// Replace the ingestion feed. Never changes the phase.
    pub fn record_feed(&mut self, update: LiveFeed) -> Result<()> {
        match &mut self.phase {
            MatchPhase::Warmup { feed, .. } | MatchPhase::Live { feed, .. } => {
                *feed = update;
                Ok(())
            }
            _ => Err(self.wrong_state("WARMUP or LIVE")),
        }
    }

    /// Cancel from any non-terminal phase. The server, if any, is kept on the
    /// cancelled phase so it can be torn down.
    pub fn cancel(&mut self, reason: CancelReason, now: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(self.wrong_state("an active state"));
        }
        let server = self.server().cloned();
        self.phase = MatchPhase::Cancelled {
            reason,
            at: now,
            server,
        };
        Ok(())
    }

    /// Record the final result
    pub fn finish(&mut self, result: MatchResult) -> Result<()> {
        let setup = match self.setup() {
            Some(setup) if !self.is_terminal() => setup.clone(),
            _ => return Err(self.wrong_state("CONFIGURING, WARMUP or LIVE")),
        };
        let server = self.server().cloned();
        self.phase = MatchPhase::Finished {
            setup,
            server,
            result,
        };
        Ok(())
    }

    /// Seconds between going live and `now`, falling back to match creation
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> i64 {
        let since = match &self.phase {
            MatchPhase::Live { started_at, .. } => *started_at,
            _ => self.created_at,
        };
        (now - since).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_match(now: DateTime<Utc>) -> Match {
        Match::new(
            GameMode::OneVsOne,
            vec!["a".to_string()],
            vec!["b".to_string()],
            vec!["m1".to_string(), "m2".to_string()],
            vec!["l1".to_string(), "l2".to_string()],
            now,
            now + Duration::seconds(20),
        )
    }

    #[test]
    fn test_confirm_flow() {
        let now = Utc::now();
        let mut m = new_match(now);

        assert_eq!(
            m.confirm("a", now).unwrap(),
            ConfirmOutcome::Recorded { remaining: 1 }
        );
        assert_eq!(m.confirm("a", now).unwrap(), ConfirmOutcome::AlreadyConfirmed);
        assert!(matches!(
            m.confirm("x", now),
            Err(MatchmakingError::NotParticipant { .. })
        ));
        assert_eq!(m.confirm("b", now).unwrap(), ConfirmOutcome::Transitioned);
        assert_eq!(m.state(), MatchStateKind::Veto);
        assert_eq!(m.confirm("b", now).unwrap(), ConfirmOutcome::AlreadyConfirmed);
    }

    #[test]
    fn test_confirm_after_deadline() {
        let now = Utc::now();
        let mut m = new_match(now);
        let late = now + Duration::seconds(21);
        assert_eq!(
            m.confirm("a", late),
            Err(MatchmakingError::ConfirmationExpired { match_id: m.id })
        );
        assert!(m.expire(late));
        assert_eq!(m.state(), MatchStateKind::Cancelled);
        assert!(!m.expire(late));
    }

    #[test]
    fn test_decline_cancels() {
        let now = Utc::now();
        let mut m = new_match(now);
        m.confirm("a", now).unwrap();
        m.decline("b", now).unwrap();
        assert_eq!(m.state(), MatchStateKind::Cancelled);
        assert!(m.decline("a", now).is_err());
        assert!(m.confirm("a", now).is_err());
    }

    #[test]
    fn test_veto_reaches_configuring() {
        let now = Utc::now();
        let mut m = new_match(now);
        assert!(matches!(
            m.ban("a", VetoKind::Map, "m1"),
            Err(MatchmakingError::WrongMatchState { .. })
        ));
        m.confirm("a", now).unwrap();
        m.confirm("b", now).unwrap();

        let first = m.ban("a", VetoKind::Map, "m1").unwrap();
        assert_eq!(first.selected.as_deref(), Some("m2"));
        assert!(first.completed.is_none());
        assert_eq!(m.state(), MatchStateKind::Veto);

        // location pool starts fresh with team A
        assert_eq!(
            m.ban("b", VetoKind::Location, "l1"),
            Err(MatchmakingError::NotYourTurn)
        );
        let last = m.ban("a", VetoKind::Location, "l2").unwrap();
        assert_eq!(
            last.completed,
            Some(MatchSetup {
                map: "m2".to_string(),
                location: "l1".to_string()
            })
        );
        assert_eq!(m.state(), MatchStateKind::Configuring);
        assert!(m.ban("b", VetoKind::Map, "m2").is_err());
    }

    #[test]
    fn test_cancel_only_from_active() {
        let now = Utc::now();
        let mut m = new_match(now);
        m.cancel(CancelReason::Operator { by: "op".to_string() }, now)
            .unwrap();
        assert!(m
            .cancel(CancelReason::ConfirmationTimeout, now)
            .is_err());
        assert!(m.go_live(now).is_err());
        assert_eq!(m.state(), MatchStateKind::Cancelled);
    }
}
