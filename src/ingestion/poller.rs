//! One ingestion tick: poll the provider, record the feed, observe it
//!
//! `poll` only writes the feed and stat counters. `observe` is the part that
//! reacts to what was recorded: everyone connected moves warmup to live, a
//! missed warmup deadline cancels, a finished feed triggers settlement.

use crate::error::{ErrorCategory, MatchmakingError, Result};
use crate::history::{PlayerStat, PlayerStatStore};
use crate::ingestion::normalize::{normalize, NormalizedFeed};
use crate::matches::service::MatchService;
use crate::matches::state::{CancelReason, LiveFeed, Match, MatchPhase};
use crate::matches::store::{require_match, transition, MatchStore};
use crate::metrics::MetricsCollector;
use crate::provider::GameServerProvider;
use crate::settlement::{SettlementEngine, SettlementOutcome};
use crate::types::{MatchId, UserId};
use crate::users::UserStore;
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep polling
    Continue,
    /// The match reached a state ingestion has nothing more to do for
    Done,
}

pub struct IngestionJob {
    matches: Arc<dyn MatchStore>,
    users: Arc<dyn UserStore>,
    stats: Arc<dyn PlayerStatStore>,
    provider: Arc<dyn GameServerProvider>,
    service: MatchService,
    settlement: Arc<SettlementEngine>,
    metrics: Arc<MetricsCollector>,
}

impl IngestionJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matches: Arc<dyn MatchStore>,
        users: Arc<dyn UserStore>,
        stats: Arc<dyn PlayerStatStore>,
        provider: Arc<dyn GameServerProvider>,
        service: MatchService,
        settlement: Arc<SettlementEngine>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            matches,
            users,
            stats,
            provider,
            service,
            settlement,
            metrics,
        }
    }

    pub async fn tick(&self, match_id: MatchId) -> Result<TickOutcome> {
        let now = current_timestamp();
        let current = match self.poll(match_id, now).await {
            Ok(Some(current)) => current,
            Ok(None) => return Ok(TickOutcome::Done),
            // the provider being down must not stop the warmup deadline
            Err(e) if e.category() == ErrorCategory::External => {
                warn!("Poll of match {} failed: {}", match_id, e);
                require_match(self.matches.as_ref(), match_id)?
            }
            Err(e) => return Err(e),
        };
        self.observe(&current, now).await
    }

    /// Fetch the provider resource and store the normalized feed. Returns
    /// `None` when the match is already terminal.
    pub async fn poll(&self, match_id: MatchId, now: DateTime<Utc>) -> Result<Option<Match>> {
        let current = require_match(self.matches.as_ref(), match_id)?;
        if current.is_terminal() {
            return Ok(None);
        }
        let server = current
            .server()
            .cloned()
            .ok_or_else(|| current.wrong_state("WARMUP or LIVE"))?;

        let started = Instant::now();
        let payload = match self.provider.fetch_match(&server.provider_match_id).await {
            Ok(payload) => {
                self.metrics
                    .record_provider_request("fetch_match", true, started.elapsed());
                self.metrics.record_ingestion_poll(true);
                payload
            }
            Err(e) => {
                self.metrics
                    .record_provider_request("fetch_match", false, started.elapsed());
                self.metrics.record_ingestion_poll(false);
                return Err(match e {
                    MatchmakingError::ExternalProvider { .. } => e,
                    other => MatchmakingError::ExternalProvider {
                        message: other.to_string(),
                    },
                });
            }
        };

        let normalized = normalize(&payload, &self.roster(&current)?);
        if !normalized.unmatched.is_empty() {
            debug!(
                "Match {}: {} provider player(s) not on the roster",
                match_id,
                normalized.unmatched.len()
            );
        }

        let feed = LiveFeed {
            score_a: normalized.score_a,
            score_b: normalized.score_b,
            finished: normalized.finished,
            connected: normalized.connected(),
            last_polled_at: Some(now),
        };
        let updated = match transition(self.matches.as_ref(), match_id, |m| {
            if m.is_terminal() {
                return Ok(false);
            }
            m.record_feed(feed.clone())?;
            Ok(true)
        })? {
            (m, true) => m,
            (_, false) => return Ok(None),
        };

        self.record_stats(&updated, &normalized)?;
        debug!(
            "Match {} polled: {}-{}{}",
            match_id,
            feed.score_a,
            feed.score_b,
            if feed.finished { " (finished)" } else { "" }
        );
        Ok(Some(updated))
    }

    /// React to the recorded feed
    pub async fn observe(&self, current: &Match, now: DateTime<Utc>) -> Result<TickOutcome> {
        match &current.phase {
            MatchPhase::Warmup { deadline, feed, .. } => {
                let missing: Vec<UserId> = current
                    .participants()
                    .filter(|user| !feed.connected.contains(*user))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    self.service.start_live(current.id).await?;
                    match self.settlement.on_live(current.id) {
                        Ok(started) if !started.is_empty() => {
                            info!(
                                "{} wager(s) went live with match {}",
                                started.len(),
                                current.id
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Could not start wagers for {}: {}", current.id, e),
                    }
                    return Ok(TickOutcome::Continue);
                }
                if now > *deadline {
                    warn!(
                        "Warmup of match {} expired with {} player(s) missing",
                        current.id,
                        missing.len()
                    );
                    self.service
                        .cancel(current.id, CancelReason::PlayerAbsent { missing })
                        .await?;
                    return Ok(TickOutcome::Done);
                }
                Ok(TickOutcome::Continue)
            }
            MatchPhase::Live { feed, .. } if feed.finished => {
                match self.settlement.settle_finished(current.id, None).await {
                    Ok(SettlementOutcome::Settled(report)) => {
                        info!(
                            "Match {} finished, team {} won",
                            report.match_id, report.winner
                        );
                        Ok(TickOutcome::Done)
                    }
                    Ok(SettlementOutcome::AlreadySettled) => Ok(TickOutcome::Done),
                    Err(e @ MatchmakingError::InvalidOutcome { .. }) => {
                        // needs an operator decision, polling will not change it
                        error!("Match {} cannot be settled: {}", current.id, e);
                        self.metrics.record_error(e.category());
                        Ok(TickOutcome::Done)
                    }
                    Err(e) => Err(e),
                }
            }
            MatchPhase::Live { .. } => Ok(TickOutcome::Continue),
            _ if current.is_terminal() => Ok(TickOutcome::Done),
            _ => Ok(TickOutcome::Continue),
        }
    }

    fn roster(&self, current: &Match) -> Result<HashMap<String, UserId>> {
        Ok(self
            .users
            .get_many(&current.participant_ids())?
            .into_values()
            .filter_map(|user| user.steam_id.clone().map(|steam| (steam, user.id)))
            .collect())
    }

    fn record_stats(&self, current: &Match, normalized: &NormalizedFeed) -> Result<()> {
        self.stats.seed(
            normalized
                .players
                .iter()
                .map(|p| PlayerStat::placeholder(current.id, p.user_id.clone(), p.side))
                .collect(),
        )?;
        for player in &normalized.players {
            self.stats.update(current.id, &player.user_id, &mut |row| {
                if row.is_final() {
                    return Ok(());
                }
                row.kills = player.kills;
                row.deaths = player.deaths;
                row.assists = player.assists;
                row.mvps = player.mvps;
                row.headshots = player.headshots;
                row.score = player.score;
                row.connected = player.connected;
                Ok(())
            })?;
        }
        Ok(())
    }
}
