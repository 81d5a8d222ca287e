//! Settlement of finished and cancelled matches
//!
//! `settle_finished` runs at most once per match. The move to `Finished` is
//! the first write and is a single transition on the match, so a duplicate
//! trigger (a retried poll, an operator racing the poller) sees
//! `AlreadySettled`. If the writes after that commit failed part way, the
//! duplicate trigger finishes them: each rating is applied once, guarded by a
//! mark on the player's stat row, and the history row is written last.

use crate::amqp::publisher::{publish_best_effort, EventPublisher};
use crate::error::{MatchmakingError, Result};
use crate::history::{MatchHistory, MatchHistoryStore, PlayerStat, PlayerStatStore};
use crate::matches::service::CancellationHandler;
use crate::matches::state::{Match, MatchPhase, MatchResult, MatchStateKind};
use crate::matches::store::{require_match, transition, MatchStore};
use crate::metrics::MetricsCollector;
use crate::provider::GameServerProvider;
use crate::settlement::elo::{EloCalculator, RatedPlayer};
use crate::trust::TrustService;
use crate::types::{GameMode, MatchEvent, MatchId, RatingChange, TeamSide, UserId, WagerId};
use crate::users::UserStore;
use crate::utils::current_timestamp;
use crate::wager::{Wager, WagerLedger, WagerState, WagerStatus, SYSTEM_ACTOR};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Operator-decided result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedResult {
    pub winner: TeamSide,
    pub by: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WagerPayoutSummary {
    pub wager_id: WagerId,
    pub winner_id: UserId,
    pub winner_prize: u64,
    pub platform_fee: u64,
}

/// Everything one settlement changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementReport {
    pub match_id: MatchId,
    pub mode: GameMode,
    pub winner: TeamSide,
    pub score_a: u32,
    pub score_b: u32,
    pub mvp: Option<UserId>,
    pub rating_changes: Vec<RatingChange>,
    pub wager_payouts: Vec<WagerPayoutSummary>,
    pub wagers_refunded: Vec<WagerId>,
    /// Wagers that could not be paid out; they are left disputed for an
    /// operator with both stakes still locked
    pub wagers_failed: Vec<WagerId>,
    pub forced_by: Option<UserId>,
}

#[derive(Debug, Default)]
struct WagerSettlement {
    payouts: Vec<WagerPayoutSummary>,
    refunded: Vec<WagerId>,
    failed: Vec<WagerId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    Settled(SettlementReport),
    /// Another trigger settled this match first
    AlreadySettled,
}

/// What a cancellation released
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancellationReport {
    pub wagers_refunded: Vec<WagerId>,
    pub server_deleted: Option<String>,
}

pub struct SettlementEngine {
    matches: Arc<dyn MatchStore>,
    users: Arc<dyn UserStore>,
    stats: Arc<dyn PlayerStatStore>,
    history: Arc<dyn MatchHistoryStore>,
    ledger: Arc<WagerLedger>,
    provider: Arc<dyn GameServerProvider>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
    calculator: EloCalculator,
    trust: Option<Arc<TrustService>>,
}

impl SettlementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        matches: Arc<dyn MatchStore>,
        users: Arc<dyn UserStore>,
        stats: Arc<dyn PlayerStatStore>,
        history: Arc<dyn MatchHistoryStore>,
        ledger: Arc<WagerLedger>,
        provider: Arc<dyn GameServerProvider>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
        calculator: EloCalculator,
    ) -> Self {
        Self {
            matches,
            users,
            stats,
            history,
            ledger,
            provider,
            publisher,
            metrics,
            calculator,
            trust: None,
        }
    }

    /// Re-derive participants' trust scores after each settlement
    pub fn with_trust(mut self, trust: Arc<TrustService>) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn ledger(&self) -> &Arc<WagerLedger> {
        &self.ledger
    }

    /// Hook for the match going live: linked wagers follow it
    pub fn on_live(&self, match_id: MatchId) -> Result<Vec<WagerId>> {
        self.ledger.start_for_match(match_id)
    }

    /// Settle a finished match: ratings, stats, history and wager payouts.
    ///
    /// Without `forced` the match must be live and the feed must report a
    /// finished game with a winner. The result, rating changes included, is
    /// committed first; the writes that follow are replayed by any later call
    /// for a match that finished without its history row.
    pub async fn settle_finished(
        &self,
        match_id: MatchId,
        forced: Option<ForcedResult>,
    ) -> Result<SettlementOutcome> {
        let started = Instant::now();
        let current = require_match(self.matches.as_ref(), match_id)?;
        if current.state() == MatchStateKind::Finished {
            if self.history.get(match_id)?.is_none() {
                warn!("Match {} finished without its history, resuming settlement", match_id);
                self.complete(&current).await?;
            } else {
                debug!("Match {} is already settled", match_id);
            }
            return Ok(SettlementOutcome::AlreadySettled);
        }

        let (winner, score_a, score_b) = Self::decide(&current, forced.as_ref())?;
        let stat_rows = self.stats.for_match(match_id)?;
        let mvp = stat_rows
            .iter()
            .filter(|s| s.mvps > 0)
            .max_by(|a, b| a.mvps.cmp(&b.mvps).then_with(|| b.user_id.cmp(&a.user_id)))
            .map(|s| s.user_id.clone());

        let users = self.users.get_many(&current.participant_ids())?;
        let rated: Vec<RatedPlayer> = [TeamSide::A, TeamSide::B]
            .into_iter()
            .flat_map(|side| current.team(side).iter().map(move |id| (side, id)))
            .map(|(side, id)| -> Result<RatedPlayer> {
                let user = users
                    .get(id)
                    .ok_or_else(|| MatchmakingError::UserNotFound {
                        user_id: id.clone(),
                    })?;
                Ok(RatedPlayer {
                    user_id: id.clone(),
                    side,
                    elo: user.elo(current.mode),
                    games_played: user.games_played(current.mode),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let rating_timer = Instant::now();
        let rating_changes = self.calculator.rate(&rated, winner)?;
        self.metrics
            .record_rating_calculation(rating_timer.elapsed());

        let now = current_timestamp();
        let result = MatchResult {
            winner,
            mvp: mvp.clone(),
            score_a,
            score_b,
            finished_at: now,
            duration_secs: current.elapsed_secs(now),
            forced_by: forced.as_ref().map(|f| f.by.clone()),
            rating_changes: rating_changes.clone(),
        };

        // the idempotency guard: only one caller gets past this transition
        let finished = match transition(self.matches.as_ref(), match_id, |m| {
            if m.state() == MatchStateKind::Finished {
                return Ok(false);
            }
            m.finish(result.clone())?;
            Ok(true)
        })? {
            (m, true) => m,
            (_, false) => {
                debug!("Match {} was settled concurrently", match_id);
                return Ok(SettlementOutcome::AlreadySettled);
            }
        };

        let wagers = self.complete(&finished).await?;

        info!(
            "Match {} settled: team {} wins {}-{}{}",
            match_id,
            winner,
            score_a,
            score_b,
            forced
                .as_ref()
                .map(|f| format!(" (forced by {})", f.by))
                .unwrap_or_default()
        );
        self.metrics.record_settlement(finished.mode, started.elapsed());

        Ok(SettlementOutcome::Settled(SettlementReport {
            match_id,
            mode: finished.mode,
            winner,
            score_a,
            score_b,
            mvp,
            rating_changes,
            wager_payouts: wagers.payouts,
            wagers_refunded: wagers.refunded,
            wagers_failed: wagers.failed,
            forced_by: forced.map(|f| f.by),
        }))
    }

    /// Everything after the `Finished` commit. Each step tolerates having
    /// run before, so a failed settlement can be resumed.
    async fn complete(&self, finished: &Match) -> Result<WagerSettlement> {
        let result = finished
            .result()
            .cloned()
            .ok_or_else(|| finished.wrong_state("FINISHED"))?;
        self.record_outcome(finished, &result)?;

        let settled_by = result.forced_by.as_deref().unwrap_or(SYSTEM_ACTOR);
        let wagers = self.settle_wagers(finished, result.winner, settled_by);

        publish_best_effort(
            self.publisher.as_ref(),
            MatchEvent::Finished {
                match_id: finished.id,
                winner: result.winner,
                score_team_a: result.score_a,
                score_team_b: result.score_b,
                rating_changes: result.rating_changes.clone(),
                timestamp: result.finished_at,
            },
        )
        .await;
        for payout in &wagers.payouts {
            publish_best_effort(
                self.publisher.as_ref(),
                MatchEvent::WagerSettled {
                    wager_id: payout.wager_id,
                    match_id: Some(finished.id),
                    winner_id: payout.winner_id.clone(),
                    winner_prize: payout.winner_prize,
                    platform_fee: payout.platform_fee,
                },
            )
            .await;
        }

        if let Some(server) = finished.server() {
            self.delete_server(&server.server_id).await;
        }
        if let Some(trust) = &self.trust {
            let trust = trust.clone();
            let participants = finished.participant_ids();
            tokio::spawn(async move {
                let refreshed = trust.refresh_all(&participants);
                debug!("Refreshed trust for {} participant(s)", refreshed);
            });
        }
        Ok(wagers)
    }

    /// Ratings, stats and the history row. The history row goes last and
    /// marks the match as fully recorded.
    fn record_outcome(&self, finished: &Match, result: &MatchResult) -> Result<()> {
        let placeholders = [TeamSide::A, TeamSide::B]
            .into_iter()
            .flat_map(|side| {
                finished
                    .team(side)
                    .iter()
                    .map(move |user| PlayerStat::placeholder(finished.id, user.clone(), side))
            })
            .collect();
        self.stats.seed(placeholders)?;

        for change in &result.rating_changes {
            if !self.claim_rating(finished.id, change)? {
                continue;
            }
            let applied = self.users.update(&change.user_id, &mut |user| {
                user.apply_rating(finished.mode, change.new_elo);
                Ok(())
            });
            if let Err(e) = applied {
                self.stats.update(finished.id, &change.user_id, &mut |row| {
                    row.old_elo = None;
                    row.new_elo = None;
                    row.elo_change = None;
                    Ok(())
                })?;
                return Err(e);
            }
        }

        let setup = finished
            .setup()
            .cloned()
            .ok_or_else(|| finished.wrong_state("FINISHED"))?;
        let inserted = self.history.insert(MatchHistory {
            match_id: finished.id,
            mode: finished.mode,
            map: setup.map,
            location: setup.location,
            team_a: finished.team_a.clone(),
            team_b: finished.team_b.clone(),
            winner: result.winner,
            score_a: result.score_a,
            score_b: result.score_b,
            mvp: result.mvp.clone(),
            rating_changes: result.rating_changes.clone(),
            created_at: finished.created_at,
            finished_at: result.finished_at,
            duration_secs: result.duration_secs,
            demo_url: None,
        })?;
        if !inserted {
            warn!("History for match {} already existed", finished.id);
        }
        Ok(())
    }

    /// Mark the player's stat row with the rating change. Only the caller
    /// that finds the row unmarked applies the change to the user.
    fn claim_rating(&self, match_id: MatchId, change: &RatingChange) -> Result<bool> {
        let mut claimed = false;
        self.stats.update(match_id, &change.user_id, &mut |row| {
            claimed = row.new_elo.is_none();
            if claimed {
                row.old_elo = Some(change.old_elo);
                row.new_elo = Some(change.new_elo);
                row.elo_change = Some(change.elo_change);
            }
            Ok(())
        })?;
        Ok(claimed)
    }

    /// Release what a cancelled match held: wager stakes and the server.
    /// Ratings are never touched.
    pub async fn settle_cancelled(&self, cancelled: &Match) -> Result<CancellationReport> {
        if cancelled.state() != MatchStateKind::Cancelled {
            return Err(cancelled.wrong_state("CANCELLED"));
        }

        let mut report = CancellationReport::default();
        for wager in self.ledger.wagers_for_match(cancelled.id)? {
            if wager.state.is_terminal() {
                continue;
            }
            self.ledger.cancel_and_refund(wager.id, SYSTEM_ACTOR)?;
            report.wagers_refunded.push(wager.id);
        }

        if let Some(server) = cancelled.server() {
            self.delete_server(&server.server_id).await;
            report.server_deleted = Some(server.server_id.clone());
        }
        info!(
            "Released cancelled match {}: {} wager(s) refunded",
            cancelled.id,
            report.wagers_refunded.len()
        );
        Ok(report)
    }

    fn decide(current: &Match, forced: Option<&ForcedResult>) -> Result<(TeamSide, u32, u32)> {
        let (score_a, score_b) = current
            .feed()
            .map(|f| (f.score_a, f.score_b))
            .unwrap_or((0, 0));

        if let Some(forced) = forced {
            return match &current.phase {
                MatchPhase::Configuring { .. } | MatchPhase::Warmup { .. } | MatchPhase::Live { .. } => {
                    Ok((forced.winner, score_a, score_b))
                }
                _ => Err(current.wrong_state("CONFIGURING, WARMUP or LIVE")),
            };
        }

        let feed = match &current.phase {
            MatchPhase::Live { feed, .. } => feed,
            _ => return Err(current.wrong_state("LIVE")),
        };
        if !feed.finished {
            return Err(MatchmakingError::InvalidOutcome {
                reason: format!("match {} has not finished", current.id),
            });
        }
        let winner = match score_a.cmp(&score_b) {
            std::cmp::Ordering::Greater => TeamSide::A,
            std::cmp::Ordering::Less => TeamSide::B,
            std::cmp::Ordering::Equal => {
                return Err(MatchmakingError::InvalidOutcome {
                    reason: format!("match {} ended level at {}-{}", current.id, score_a, score_b),
                })
            }
        };
        Ok((winner, score_a, score_b))
    }

    fn settle_wagers(
        &self,
        finished: &Match,
        winner: TeamSide,
        settled_by: &str,
    ) -> WagerSettlement {
        let mut settlement = WagerSettlement::default();
        let wagers = match self.ledger.wagers_for_match(finished.id) {
            Ok(wagers) => wagers,
            Err(e) => {
                error!("Could not load wagers for match {}: {}", finished.id, e);
                self.metrics.record_error(e.category());
                return settlement;
            }
        };

        for wager in wagers {
            let outcome = match wager.status() {
                WagerStatus::Locked | WagerStatus::Live => {
                    match Self::winning_side_user(&wager, finished, winner) {
                        Some(winner_id) => self
                            .ledger
                            .settle(wager.id, &winner_id, settled_by)
                            .map(|settled| {
                                if let WagerState::Finished(payout) = settled.state {
                                    settlement.payouts.push(WagerPayoutSummary {
                                        wager_id: settled.id,
                                        winner_id: payout.winner_id,
                                        winner_prize: payout.winner_prize,
                                        platform_fee: payout.platform_fee,
                                    });
                                }
                            }),
                        None => Err(MatchmakingError::FinancialInvariant {
                            reason: format!(
                                "neither side of wager {} is on the winning team",
                                wager.id
                            ),
                        }),
                    }
                }
                // nobody accepted before the match ended
                WagerStatus::Waiting => self
                    .ledger
                    .cancel_and_refund(wager.id, SYSTEM_ACTOR)
                    .map(|_| settlement.refunded.push(wager.id)),
                WagerStatus::Disputed => {
                    warn!("Wager {} is disputed, leaving it for an operator", wager.id);
                    Ok(())
                }
                WagerStatus::Finished | WagerStatus::Cancelled => Ok(()),
            };
            if let Err(e) = outcome {
                let closed = matches!(
                    self.ledger.get(wager.id).map(|w| w.status()),
                    Ok(WagerStatus::Finished | WagerStatus::Cancelled)
                );
                if closed {
                    debug!("Wager {} was closed concurrently", wager.id);
                    continue;
                }
                error!("Wager {} was not settled: {}", wager.id, e);
                self.metrics.record_error(e.category());
                if let Err(flag_err) =
                    self.ledger
                        .mark_disputed(wager.id, SYSTEM_ACTOR, &format!("settlement failed: {}", e))
                {
                    error!("Could not flag wager {} for review: {}", wager.id, flag_err);
                }
                settlement.failed.push(wager.id);
            }
        }
        settlement
    }

    fn winning_side_user(wager: &Wager, finished: &Match, winner: TeamSide) -> Option<UserId> {
        let opponent = wager.opponent_id()?;
        match (
            finished.side_of(&wager.creator.user_id),
            finished.side_of(opponent),
        ) {
            (Some(side), _) if side == winner => Some(wager.creator.user_id.clone()),
            (_, Some(side)) if side == winner => Some(opponent.to_string()),
            _ => None,
        }
    }

    async fn delete_server(&self, server_id: &str) {
        let started = Instant::now();
        match self.provider.delete_server(server_id).await {
            Ok(()) => {
                self.metrics
                    .record_provider_request("delete_server", true, started.elapsed());
                debug!("Deleted server {}", server_id);
            }
            Err(e) => {
                self.metrics
                    .record_provider_request("delete_server", false, started.elapsed());
                warn!("Failed to delete server {}: {}", server_id, e);
            }
        }
    }
}

#[async_trait]
impl CancellationHandler for SettlementEngine {
    async fn on_cancelled(&self, cancelled: &Match) -> Result<()> {
        self.settle_cancelled(cancelled).await.map(|_| ())
    }
}
