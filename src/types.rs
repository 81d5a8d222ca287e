//! Common types used throughout the match lifecycle engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable user identifier, as resolved by the identity provider
pub type UserId = String;

/// Unique identifier for matches
pub type MatchId = Uuid;

/// Unique identifier for wagers
pub type WagerId = Uuid;

/// Unique identifier for parties
pub type PartyId = Uuid;

/// Competitive mode a player queues for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GameMode {
    #[serde(rename = "1v1")]
    OneVsOne,
    #[serde(rename = "5v5")]
    FiveVsFive,
}

impl GameMode {
    pub const ALL: [GameMode; 2] = [GameMode::OneVsOne, GameMode::FiveVsFive];

    /// Number of players on each side
    pub fn team_size(&self) -> usize {
        match self {
            GameMode::OneVsOne => 1,
            GameMode::FiveVsFive => 5,
        }
    }

    /// Total number of participants in a match of this mode
    pub fn match_size(&self) -> usize {
        self.team_size() * 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::OneVsOne => "1v1",
            GameMode::FiveVsFive => "5v5",
        }
    }
}

impl std::fmt::Display for GameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One side of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TeamSide {
    A,
    B,
}

impl TeamSide {
    pub fn opponent(&self) -> TeamSide {
        match self {
            TeamSide::A => TeamSide::B,
            TeamSide::B => TeamSide::A,
        }
    }
}

impl std::fmt::Display for TeamSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeamSide::A => write!(f, "A"),
            TeamSide::B => write!(f, "B"),
        }
    }
}

/// Which veto pool a ban applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VetoKind {
    Map,
    Location,
}

impl std::fmt::Display for VetoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VetoKind::Map => write!(f, "map"),
            VetoKind::Location => write!(f, "location"),
        }
    }
}

/// Player action delivered through the command queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlayerAction {
    JoinQueue { mode: GameMode },
    LeaveQueue,
    Confirm { match_id: MatchId },
    Decline { match_id: MatchId },
    Ban {
        match_id: MatchId,
        kind: VetoKind,
        item: String,
    },
    RequestProvisioning { match_id: MatchId },
}

/// Command envelope stamped by the identity gateway.
///
/// `user_id` is the id the gateway resolved from the session; it is the only
/// identity the engine acts on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerCommand {
    pub user_id: UserId,
    #[serde(flatten)]
    pub action: PlayerAction,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted by the queue store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Joined {
        user_ids: Vec<UserId>,
        mode: GameMode,
        joined_at: DateTime<Utc>,
    },
    Left {
        user_ids: Vec<UserId>,
        mode: GameMode,
        timestamp: DateTime<Utc>,
    },
}

/// Per-player rating outcome carried on the finished event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingChange {
    pub user_id: UserId,
    pub old_elo: i32,
    pub new_elo: i32,
    pub elo_change: i32,
}

/// Event emitted on every match lifecycle step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MatchEvent {
    Created {
        match_id: MatchId,
        mode: GameMode,
        team_a: Vec<UserId>,
        team_b: Vec<UserId>,
        confirmation_deadline: DateTime<Utc>,
    },
    Confirmed {
        match_id: MatchId,
        timestamp: DateTime<Utc>,
    },
    Cancelled {
        match_id: MatchId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    Banned {
        match_id: MatchId,
        kind: VetoKind,
        item: String,
        by: TeamSide,
        selected: Option<String>,
    },
    VetoCompleted {
        match_id: MatchId,
        map: String,
        location: String,
    },
    ServerReady {
        match_id: MatchId,
        server_ip: String,
        timestamp: DateTime<Utc>,
    },
    Live {
        match_id: MatchId,
        timestamp: DateTime<Utc>,
    },
    Finished {
        match_id: MatchId,
        winner: TeamSide,
        score_team_a: u32,
        score_team_b: u32,
        rating_changes: Vec<RatingChange>,
        timestamp: DateTime<Utc>,
    },
    WagerSettled {
        wager_id: WagerId,
        match_id: Option<MatchId>,
        winner_id: UserId,
        winner_prize: u64,
        platform_fee: u64,
    },
}

impl MatchEvent {
    /// Short event name used for routing keys and metrics
    pub fn name(&self) -> &'static str {
        match self {
            MatchEvent::Created { .. } => "created",
            MatchEvent::Confirmed { .. } => "confirmed",
            MatchEvent::Cancelled { .. } => "cancelled",
            MatchEvent::Banned { .. } => "banned",
            MatchEvent::VetoCompleted { .. } => "veto_completed",
            MatchEvent::ServerReady { .. } => "server_ready",
            MatchEvent::Live { .. } => "live",
            MatchEvent::Finished { .. } => "finished",
            MatchEvent::WagerSettled { .. } => "wager_settled",
        }
    }

    /// Identity of the lifecycle step this event reports. A re-published
    /// step yields the same key.
    pub fn dedup_key(&self) -> String {
        match self {
            MatchEvent::Created { match_id, .. }
            | MatchEvent::Confirmed { match_id, .. }
            | MatchEvent::Cancelled { match_id, .. }
            | MatchEvent::VetoCompleted { match_id, .. }
            | MatchEvent::ServerReady { match_id, .. }
            | MatchEvent::Live { match_id, .. }
            | MatchEvent::Finished { match_id, .. } => format!("{}:{}", match_id, self.name()),
            MatchEvent::Banned {
                match_id,
                kind,
                item,
                ..
            } => format!("{}:banned:{}:{}", match_id, kind, item),
            MatchEvent::WagerSettled { wager_id, .. } => format!("wager:{}:settled", wager_id),
        }
    }
}

/// Union type for all AMQP messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AmqpMessage {
    PlayerCommand(PlayerCommand),
    QueueEvent(QueueEvent),
    MatchEvent(MatchEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_sizes() {
        assert_eq!(GameMode::OneVsOne.team_size(), 1);
        assert_eq!(GameMode::FiveVsFive.match_size(), 10);
        assert_eq!(GameMode::FiveVsFive.to_string(), "5v5");
    }

    #[test]
    fn test_command_wire_format() {
        let json = r#"{"user_id":"u1","action":"ban","match_id":"5f0c6f3e-9a55-4a8e-9a77-1c2f4b9d0e11","kind":"map","item":"de_nuke","timestamp":"2026-01-01T00:00:00Z"}"#;
        let command: PlayerCommand = serde_json::from_str(json).unwrap();
        assert_eq!(command.user_id, "u1");
        match command.action {
            PlayerAction::Ban { kind, item, .. } => {
                assert_eq!(kind, VetoKind::Map);
                assert_eq!(item, "de_nuke");
            }
            other => panic!("unexpected action {:?}", other),
        }

        let join: PlayerAction = serde_json::from_str(r#"{"action":"join_queue","mode":"5v5"}"#).unwrap();
        assert_eq!(
            join,
            PlayerAction::JoinQueue {
                mode: GameMode::FiveVsFive
            }
        );
    }

    #[test]
    fn test_dedup_key_repeats_per_step() {
        let match_id = uuid::Uuid::new_v4();
        let live = |at| MatchEvent::Live {
            match_id,
            timestamp: at,
        };
        let first = live(Utc::now());
        let again = live(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(first.dedup_key(), again.dedup_key());

        let ban = |item: &str| MatchEvent::Banned {
            match_id,
            kind: VetoKind::Map,
            item: item.to_string(),
            by: TeamSide::A,
            selected: None,
        };
        assert_ne!(ban("de_nuke").dedup_key(), ban("de_inferno").dedup_key());
        assert_ne!(first.dedup_key(), ban("de_nuke").dedup_key());
    }
}
