//! Operator actions on matches and wagers
//!
//! Every operation authorizes the actor first and appends an audit entry
//! once the change has been made.

use crate::amqp::publisher::{publish_best_effort, EventPublisher};
use crate::audit::{AuditEntry, AuditLog};
use crate::auth::{AdminAction, AuthorizationPolicy};
use crate::error::Result;
use crate::ingestion::IngestionScheduler;
use crate::matches::service::MatchService;
use crate::matches::state::{CancelReason, Match};
use crate::settlement::{ForcedResult, SettlementEngine, SettlementOutcome};
use crate::types::{MatchEvent, MatchId, TeamSide, WagerId};
use crate::wager::{RevenueStats, Wager, WagerLedger, WagerState};
use std::sync::Arc;
use tracing::{info, warn};

pub struct AdminService {
    policy: Arc<dyn AuthorizationPolicy>,
    audit: Arc<dyn AuditLog>,
    matches: MatchService,
    settlement: Arc<SettlementEngine>,
    ledger: Arc<WagerLedger>,
    publisher: Arc<dyn EventPublisher>,
    ingestion: Option<Arc<IngestionScheduler>>,
}

impl AdminService {
    pub fn new(
        policy: Arc<dyn AuthorizationPolicy>,
        audit: Arc<dyn AuditLog>,
        matches: MatchService,
        settlement: Arc<SettlementEngine>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let ledger = settlement.ledger().clone();
        Self {
            policy,
            audit,
            matches,
            settlement,
            ledger,
            publisher,
            ingestion: None,
        }
    }

    /// Stop polling a match as soon as an operator ends it
    pub fn with_ingestion(mut self, scheduler: Arc<IngestionScheduler>) -> Self {
        self.ingestion = Some(scheduler);
        self
    }

    /// Settle a match with an operator-chosen winner
    pub async fn force_finish_match(
        &self,
        actor: &str,
        match_id: MatchId,
        winner: TeamSide,
    ) -> Result<SettlementOutcome> {
        self.policy
            .authorize(actor, AdminAction::ForceFinishMatch)
            .await?;
        let outcome = self
            .settlement
            .settle_finished(
                match_id,
                Some(ForcedResult {
                    winner,
                    by: actor.to_string(),
                }),
            )
            .await?;
        self.stop_ingestion(match_id);

        let detail = match &outcome {
            SettlementOutcome::Settled(report) => format!(
                "team {} declared winner, {} rating change(s), {} wager payout(s)",
                winner,
                report.rating_changes.len(),
                report.wager_payouts.len()
            ),
            SettlementOutcome::AlreadySettled => "already settled, nothing changed".to_string(),
        };
        info!("{} force-finished match {}: {}", actor, match_id, detail);
        self.append(AuditEntry::new(
            actor,
            AdminAction::ForceFinishMatch,
            match_id,
            detail,
        ))?;
        Ok(outcome)
    }

    pub async fn cancel_match(&self, actor: &str, match_id: MatchId) -> Result<Match> {
        self.policy.authorize(actor, AdminAction::CancelMatch).await?;
        let cancelled = self
            .matches
            .cancel(
                match_id,
                CancelReason::Operator {
                    by: actor.to_string(),
                },
            )
            .await?;
        self.stop_ingestion(match_id);
        self.append(AuditEntry::new(
            actor,
            AdminAction::CancelMatch,
            match_id,
            "match cancelled",
        ))?;
        Ok(cancelled)
    }

    /// Refund both stakes of a non-terminal wager
    pub async fn cancel_wager(&self, actor: &str, wager_id: WagerId) -> Result<Wager> {
        self.policy.authorize(actor, AdminAction::CancelWager).await?;
        let wager = self.ledger.cancel_and_refund(wager_id, actor)?;
        self.append(AuditEntry::new(
            actor,
            AdminAction::CancelWager,
            wager_id,
            format!("stakes of {} refunded", wager.amount),
        ))?;
        Ok(wager)
    }

    pub async fn force_wager_winner(
        &self,
        actor: &str,
        wager_id: WagerId,
        winner_id: &str,
    ) -> Result<Wager> {
        self.policy
            .authorize(actor, AdminAction::ForceWagerWinner)
            .await?;
        let wager = self.ledger.force_winner(wager_id, winner_id, actor)?;

        if let WagerState::Finished(payout) = &wager.state {
            publish_best_effort(
                self.publisher.as_ref(),
                MatchEvent::WagerSettled {
                    wager_id,
                    match_id: wager.match_id,
                    winner_id: payout.winner_id.clone(),
                    winner_prize: payout.winner_prize,
                    platform_fee: payout.platform_fee,
                },
            )
            .await;
            self.append(AuditEntry::new(
                actor,
                AdminAction::ForceWagerWinner,
                wager_id,
                format!(
                    "{} paid {} (fee {})",
                    payout.winner_id, payout.winner_prize, payout.platform_fee
                ),
            ))?;
        } else {
            warn!("Forced wager {} did not finish", wager_id);
        }
        Ok(wager)
    }

    pub async fn mark_wager_disputed(
        &self,
        actor: &str,
        wager_id: WagerId,
        reason: &str,
    ) -> Result<Wager> {
        self.policy
            .authorize(actor, AdminAction::MarkWagerDisputed)
            .await?;
        let wager = self.ledger.mark_disputed(wager_id, actor, reason)?;
        self.append(AuditEntry::new(
            actor,
            AdminAction::MarkWagerDisputed,
            wager_id,
            reason,
        ))?;
        Ok(wager)
    }

    pub async fn revenue_stats(&self, actor: &str) -> Result<RevenueStats> {
        self.policy.authorize(actor, AdminAction::ViewRevenue).await?;
        self.ledger.revenue_stats()
    }

    pub fn audit_trail(&self, target: &str) -> Result<Vec<AuditEntry>> {
        self.audit.for_target(target)
    }

    fn stop_ingestion(&self, match_id: MatchId) {
        if let Some(scheduler) = &self.ingestion {
            scheduler.stop(match_id);
        }
    }

    fn append(&self, entry: AuditEntry) -> Result<()> {
        self.audit.record(entry)
    }
}
