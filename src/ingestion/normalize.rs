//! Provider payload normalization
//!
//! Team score is rounds won, which the provider only exposes as the sum of
//! each team's per-player MVP counters. The per-player `score` field is an
//! in-game point total and is never used for the team score.

use crate::provider::types::{ProviderMatch, TEAM_A_LABEL, TEAM_B_LABEL};
use crate::types::{TeamSide, UserId};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// One provider player row joined to a participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPlayer {
    pub user_id: UserId,
    pub side: TeamSide,
    pub kills: u32,
    pub deaths: u32,
    pub assists: u32,
    pub mvps: u32,
    pub headshots: u32,
    pub score: u32,
    pub connected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedFeed {
    pub score_a: u32,
    pub score_b: u32,
    pub finished: bool,
    pub players: Vec<NormalizedPlayer>,
    /// Steam ids the provider reported that are not participants
    pub unmatched: Vec<String>,
}

impl NormalizedFeed {
    pub fn connected(&self) -> BTreeSet<UserId> {
        self.players
            .iter()
            .filter(|p| p.connected)
            .map(|p| p.user_id.clone())
            .collect()
    }
}

/// Map a provider team label to our side
pub fn side_for_label(label: &str) -> Option<TeamSide> {
    match label {
        TEAM_A_LABEL => Some(TeamSide::A),
        TEAM_B_LABEL => Some(TeamSide::B),
        _ => None,
    }
}

/// Normalize a provider match against `roster`, which maps linked steam ids
/// to participant user ids.
pub fn normalize(payload: &ProviderMatch, roster: &HashMap<String, UserId>) -> NormalizedFeed {
    let mut feed = NormalizedFeed {
        finished: payload.finished,
        ..NormalizedFeed::default()
    };

    for player in &payload.players {
        let side = match side_for_label(&player.team) {
            Some(side) => side,
            None => {
                warn!(
                    "Skipping player {} with unknown team label '{}' in provider match {}",
                    player.steam_id_64, player.team, payload.id
                );
                continue;
            }
        };
        match side {
            TeamSide::A => feed.score_a = feed.score_a.saturating_add(player.stats.mvps),
            TeamSide::B => feed.score_b = feed.score_b.saturating_add(player.stats.mvps),
        }

        let user_id = match roster.get(&player.steam_id_64) {
            Some(user_id) => user_id.clone(),
            None => {
                debug!(
                    "Provider match {} reports unknown steam id {}",
                    payload.id, player.steam_id_64
                );
                feed.unmatched.push(player.steam_id_64.clone());
                continue;
            }
        };
        feed.players.push(NormalizedPlayer {
            user_id,
            side,
            kills: player.stats.kills,
            deaths: player.stats.deaths,
            assists: player.stats.assists,
            mvps: player.stats.mvps,
            headshots: player.stats.headshots,
            score: player.stats.score,
            connected: player.connected,
        });
    }
    feed
}
