//! Player stat rows and immutable match history

use crate::error::{MatchmakingError, Result};
use crate::types::{GameMode, MatchId, RatingChange, TeamSide, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-player row for one match. Counters are overwritten by ingestion until
/// settlement fills in the rating fields, after which the row is final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStat {
    pub match_id: MatchId,
    pub user_id: UserId,
    pub team: TeamSide,
    pub kills: u32,
    pub deaths: u32,
    pub assists: u32,
    pub mvps: u32,
    pub headshots: u32,
    pub score: u32,
    pub connected: bool,
    pub old_elo: Option<i32>,
    pub new_elo: Option<i32>,
    pub elo_change: Option<i32>,
}

impl PlayerStat {
    pub fn placeholder(match_id: MatchId, user_id: impl Into<UserId>, team: TeamSide) -> Self {
        Self {
            match_id,
            user_id: user_id.into(),
            team,
            kills: 0,
            deaths: 0,
            assists: 0,
            mvps: 0,
            headshots: 0,
            score: 0,
            connected: false,
            old_elo: None,
            new_elo: None,
            elo_change: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.new_elo.is_some()
    }
}

/// Snapshot of a finished match, written once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchHistory {
    pub match_id: MatchId,
    pub mode: GameMode,
    pub map: String,
    pub location: String,
    pub team_a: Vec<UserId>,
    pub team_b: Vec<UserId>,
    pub winner: TeamSide,
    pub score_a: u32,
    pub score_b: u32,
    pub mvp: Option<UserId>,
    pub rating_changes: Vec<RatingChange>,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub demo_url: Option<String>,
}

impl MatchHistory {
    pub fn side_of(&self, user_id: &str) -> Option<TeamSide> {
        if self.team_a.iter().any(|u| u == user_id) {
            Some(TeamSide::A)
        } else if self.team_b.iter().any(|u| u == user_id) {
            Some(TeamSide::B)
        } else {
            None
        }
    }

    /// `(rounds for, rounds against)` from a side's point of view
    pub fn score_for(&self, side: TeamSide) -> (u32, u32) {
        match side {
            TeamSide::A => (self.score_a, self.score_b),
            TeamSide::B => (self.score_b, self.score_a),
        }
    }
}

pub trait PlayerStatStore: Send + Sync {
    /// Insert placeholder rows for players that have none yet
    fn seed(&self, rows: Vec<PlayerStat>) -> Result<()>;

    /// Atomically modify one row
    fn update(
        &self,
        match_id: MatchId,
        user_id: &str,
        apply: &mut dyn FnMut(&mut PlayerStat) -> Result<()>,
    ) -> Result<PlayerStat>;

    fn for_match(&self, match_id: MatchId) -> Result<Vec<PlayerStat>>;

    fn for_user(&self, user_id: &str) -> Result<Vec<PlayerStat>>;
}

pub trait MatchHistoryStore: Send + Sync {
    /// Insert once. Returns false, changing nothing, if a row already exists.
    fn insert(&self, history: MatchHistory) -> Result<bool>;

    fn get(&self, match_id: MatchId) -> Result<Option<MatchHistory>>;

    /// Every match the user played, newest first
    fn for_user(&self, user_id: &str) -> Result<Vec<MatchHistory>>;
}

/// In-memory implementation of both history stores
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    stats: RwLock<HashMap<(MatchId, UserId), PlayerStat>>,
    history: RwLock<HashMap<MatchId, MatchHistory>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlayerStatStore for InMemoryHistoryStore {
    fn seed(&self, rows: Vec<PlayerStat>) -> Result<()> {
        let mut stats = self
            .stats
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("player stats write"))?;
        for row in rows {
            stats
                .entry((row.match_id, row.user_id.clone()))
                .or_insert(row);
        }
        Ok(())
    }

    fn update(
        &self,
        match_id: MatchId,
        user_id: &str,
        apply: &mut dyn FnMut(&mut PlayerStat) -> Result<()>,
    ) -> Result<PlayerStat> {
        let mut stats = self
            .stats
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("player stats write"))?;
        let key = (match_id, user_id.to_string());
        let current = stats
            .get(&key)
            .ok_or_else(|| MatchmakingError::NotParticipant {
                match_id,
                user_id: user_id.to_string(),
            })?;

        let mut next = current.clone();
        apply(&mut next)?;
        stats.insert(key, next.clone());
        Ok(next)
    }

    fn for_match(&self, match_id: MatchId) -> Result<Vec<PlayerStat>> {
        let stats = self
            .stats
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("player stats read"))?;
        let mut rows: Vec<PlayerStat> = stats
            .values()
            .filter(|s| s.match_id == match_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.team as u8, &a.user_id).cmp(&(b.team as u8, &b.user_id)));
        Ok(rows)
    }

    fn for_user(&self, user_id: &str) -> Result<Vec<PlayerStat>> {
        let stats = self
            .stats
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("player stats read"))?;
        Ok(stats
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }
}

impl MatchHistoryStore for InMemoryHistoryStore {
    fn insert(&self, history: MatchHistory) -> Result<bool> {
        let mut rows = self
            .history
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("match history write"))?;
        if rows.contains_key(&history.match_id) {
            return Ok(false);
        }
        rows.insert(history.match_id, history);
        Ok(true)
    }

    fn get(&self, match_id: MatchId) -> Result<Option<MatchHistory>> {
        let rows = self
            .history
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("match history read"))?;
        Ok(rows.get(&match_id).cloned())
    }

    fn for_user(&self, user_id: &str) -> Result<Vec<MatchHistory>> {
        let rows = self
            .history
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("match history read"))?;
        let mut found: Vec<MatchHistory> = rows
            .values()
            .filter(|h| h.side_of(user_id).is_some())
            .cloned()
            .collect();
        found.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        Ok(found)
    }
}
