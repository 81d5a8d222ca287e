//! Read models over match history: profile history, Elo curve, map win
//! rates and aggregate stats.

use crate::error::Result;
use crate::history::store::{MatchHistoryStore, PlayerStatStore};
use crate::types::{GameMode, MatchId, UserId};
use crate::utils::percentage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One row of a user's match list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMatchSummary {
    pub match_id: MatchId,
    pub mode: GameMode,
    pub map: String,
    pub won: bool,
    pub rounds_for: u32,
    pub rounds_against: u32,
    pub kills: u32,
    pub deaths: u32,
    pub elo_change: Option<i32>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EloPoint {
    pub match_id: MatchId,
    pub elo: i32,
    pub change: i32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapWinRate {
    pub map: String,
    pub played: u64,
    pub won: u64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub matches: u64,
    pub wins: u64,
    pub losses: u64,
    pub win_rate: f64,
    pub kills: u64,
    pub deaths: u64,
    pub assists: u64,
    pub kd_ratio: f64,
    pub headshot_pct: f64,
    pub mvps: u64,
}

#[derive(Clone)]
pub struct HistoryQueries {
    history: Arc<dyn MatchHistoryStore>,
    stats: Arc<dyn PlayerStatStore>,
}

impl HistoryQueries {
    pub fn new(history: Arc<dyn MatchHistoryStore>, stats: Arc<dyn PlayerStatStore>) -> Self {
        Self { history, stats }
    }

    /// Finished matches of a user, newest first. `page` starts at 0.
    pub fn user_history(
        &self,
        user_id: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<UserMatchSummary>> {
        let stats: HashMap<MatchId, _> = self
            .stats
            .for_user(user_id)?
            .into_iter()
            .map(|s| (s.match_id, s))
            .collect();

        Ok(self
            .history
            .for_user(user_id)?
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .filter_map(|h| {
                let side = h.side_of(user_id)?;
                let (rounds_for, rounds_against) = h.score_for(side);
                let stat = stats.get(&h.match_id);
                Some(UserMatchSummary {
                    match_id: h.match_id,
                    mode: h.mode,
                    map: h.map.clone(),
                    won: h.winner == side,
                    rounds_for,
                    rounds_against,
                    kills: stat.map(|s| s.kills).unwrap_or(0),
                    deaths: stat.map(|s| s.deaths).unwrap_or(0),
                    elo_change: stat.and_then(|s| s.elo_change),
                    finished_at: h.finished_at,
                })
            })
            .collect())
    }

    /// Rating after each settled match in a mode, oldest first
    pub fn elo_history(&self, user_id: &UserId, mode: GameMode) -> Result<Vec<EloPoint>> {
        let mut points: Vec<EloPoint> = self
            .history
            .for_user(user_id)?
            .into_iter()
            .filter(|h| h.mode == mode)
            .filter_map(|h| {
                let change = h.rating_changes.iter().find(|c| &c.user_id == user_id)?;
                Some(EloPoint {
                    match_id: h.match_id,
                    elo: change.new_elo,
                    change: change.elo_change,
                    at: h.finished_at,
                })
            })
            .collect();
        points.sort_by_key(|p| p.at);
        Ok(points)
    }

    /// Win rate per map, most played first
    pub fn map_win_rates(&self, user_id: &str) -> Result<Vec<MapWinRate>> {
        let mut per_map: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for h in self.history.for_user(user_id)? {
            if let Some(side) = h.side_of(user_id) {
                let entry = per_map.entry(h.map.clone()).or_default();
                entry.0 += 1;
                if h.winner == side {
                    entry.1 += 1;
                }
            }
        }

        let mut rates: Vec<MapWinRate> = per_map
            .into_iter()
            .map(|(map, (played, won))| MapWinRate {
                map,
                played,
                won,
                win_rate: percentage(won, played),
            })
            .collect();
        rates.sort_by(|a, b| b.played.cmp(&a.played).then_with(|| a.map.cmp(&b.map)));
        Ok(rates)
    }

    /// Lifetime totals over settled matches
    pub fn aggregate_stats(&self, user_id: &str) -> Result<AggregateStats> {
        let mut totals = AggregateStats::default();
        for h in self.history.for_user(user_id)? {
            if let Some(side) = h.side_of(user_id) {
                totals.matches += 1;
                if h.winner == side {
                    totals.wins += 1;
                } else {
                    totals.losses += 1;
                }
            }
        }

        let mut headshots = 0u64;
        for stat in self.stats.for_user(user_id)?.iter().filter(|s| s.is_final()) {
            totals.kills += u64::from(stat.kills);
            totals.deaths += u64::from(stat.deaths);
            totals.assists += u64::from(stat.assists);
            totals.mvps += u64::from(stat.mvps);
            headshots += u64::from(stat.headshots);
        }

        totals.win_rate = percentage(totals.wins, totals.matches);
        totals.kd_ratio = if totals.deaths == 0 {
            totals.kills as f64
        } else {
            totals.kills as f64 / totals.deaths as f64
        };
        totals.headshot_pct = percentage(headshots, totals.kills);
        Ok(totals)
    }
}
