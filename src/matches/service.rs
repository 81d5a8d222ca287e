//! Match operations exposed to players and background jobs
//!
//! Confirmation, decline, veto bans, cancellation and the confirmation
//! sweeper. Every mutation is a single [`transition`] on the store; events
//! are published after the transition commits.

use crate::amqp::publisher::{publish_best_effort, EventPublisher};
use crate::config::LifecycleConfig;
use crate::error::Result;
use crate::matches::state::{
    BanOutcome, CancelReason, ConfirmOutcome, Match, MatchPhase, MatchStateKind,
};
use crate::matches::store::{require_match, transition, MatchStore};
use crate::metrics::MetricsCollector;
use crate::types::{MatchEvent, MatchId, VetoKind};
use crate::utils::current_timestamp;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Follow-up work for a match that was just cancelled (refunds, server
/// teardown). Runs after the cancellation has committed.
#[async_trait]
pub trait CancellationHandler: Send + Sync {
    async fn on_cancelled(&self, cancelled: &Match) -> Result<()>;
}

#[derive(Clone)]
pub struct MatchService {
    store: Arc<dyn MatchStore>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
    lifecycle: LifecycleConfig,
    cancellation_handler: Option<Arc<dyn CancellationHandler>>,
}

impl MatchService {
    pub fn new(
        store: Arc<dyn MatchStore>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
        lifecycle: LifecycleConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            metrics,
            lifecycle,
            cancellation_handler: None,
        }
    }

    pub fn with_cancellation_handler(mut self, handler: Arc<dyn CancellationHandler>) -> Self {
        self.cancellation_handler = Some(handler);
        self
    }

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    pub fn get(&self, match_id: MatchId) -> Result<Match> {
        require_match(self.store.as_ref(), match_id)
    }

    /// The caller's current non-terminal match
    pub fn active_match_for(&self, user_id: &str) -> Result<Option<Match>> {
        self.store.active_match_for(user_id)
    }

    pub async fn confirm(&self, match_id: MatchId, user_id: &str) -> Result<ConfirmOutcome> {
        self.confirm_at(match_id, user_id, current_timestamp()).await
    }

    /// Record a confirmation as of `now`. Exactly one caller observes
    /// `Transitioned`, however many confirmations race.
    pub async fn confirm_at(
        &self,
        match_id: MatchId,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ConfirmOutcome> {
        let (_, outcome) =
            transition(self.store.as_ref(), match_id, |m| m.confirm(user_id, now))?;

        match &outcome {
            ConfirmOutcome::Transitioned => {
                info!("Match {} confirmed by all players, veto started", match_id);
                self.metrics.record_transition(MatchStateKind::Veto);
                publish_best_effort(
                    self.publisher.as_ref(),
                    MatchEvent::Confirmed {
                        match_id,
                        timestamp: now,
                    },
                )
                .await;
            }
            ConfirmOutcome::Recorded { remaining } => {
                debug!(
                    "{} confirmed match {}, {} remaining",
                    user_id, match_id, remaining
                );
            }
            ConfirmOutcome::AlreadyConfirmed => {
                debug!("{} already confirmed match {}", user_id, match_id);
            }
        }
        Ok(outcome)
    }

    /// Refuse a match; it is cancelled for everyone
    pub async fn decline(&self, match_id: MatchId, user_id: &str) -> Result<Match> {
        let now = current_timestamp();
        let (cancelled, _) =
            transition(self.store.as_ref(), match_id, |m| m.decline(user_id, now))?;
        info!("Match {} declined by {}", match_id, user_id);
        self.after_cancel(&cancelled).await;
        Ok(cancelled)
    }

    /// Ban a map or location on behalf of the caller's team
    pub async fn ban(
        &self,
        match_id: MatchId,
        user_id: &str,
        kind: VetoKind,
        item: &str,
    ) -> Result<BanOutcome> {
        let (_, outcome) =
            transition(self.store.as_ref(), match_id, |m| m.ban(user_id, kind, item))?;

        info!(
            "Team {} banned {} {} in match {}{}",
            outcome.by,
            kind,
            item,
            match_id,
            outcome
                .selected
                .as_ref()
                .map(|s| format!(", {} selected", s))
                .unwrap_or_default()
        );
        publish_best_effort(
            self.publisher.as_ref(),
            MatchEvent::Banned {
                match_id,
                kind,
                item: item.to_string(),
                by: outcome.by,
                selected: outcome.selected.clone(),
            },
        )
        .await;

        if let Some(setup) = &outcome.completed {
            info!(
                "Veto complete for match {}: {} in {}",
                match_id, setup.map, setup.location
            );
            self.metrics.record_transition(MatchStateKind::Configuring);
            publish_best_effort(
                self.publisher.as_ref(),
                MatchEvent::VetoCompleted {
                    match_id,
                    map: setup.map.clone(),
                    location: setup.location.clone(),
                },
            )
            .await;
        }
        Ok(outcome)
    }

    /// Cancel a non-terminal match
    pub async fn cancel(&self, match_id: MatchId, reason: CancelReason) -> Result<Match> {
        let now = current_timestamp();
        let (cancelled, _) = transition(self.store.as_ref(), match_id, |m| {
            m.cancel(reason.clone(), now)
        })?;
        info!("Match {} cancelled: {}", match_id, reason);
        self.after_cancel(&cancelled).await;
        Ok(cancelled)
    }

    /// Move a warmup match to live
    pub async fn start_live(&self, match_id: MatchId) -> Result<Match> {
        let now = current_timestamp();
        let (live, _) = transition(self.store.as_ref(), match_id, |m| m.go_live(now))?;
        info!("Match {} is live", match_id);
        self.metrics.record_transition(MatchStateKind::Live);
        publish_best_effort(
            self.publisher.as_ref(),
            MatchEvent::Live {
                match_id,
                timestamp: now,
            },
        )
        .await;
        Ok(live)
    }

    /// Cancel every confirming match whose deadline passed before `now`
    pub async fn expire_confirmations(&self, now: DateTime<Utc>) -> Result<Vec<MatchId>> {
        let mut expired = Vec::new();
        for candidate in self.store.list_by_state(MatchStateKind::Confirming)? {
            let result = transition(self.store.as_ref(), candidate.id, |m| Ok(m.expire(now)));
            match result {
                Ok((cancelled, true)) => {
                    info!("Match {} expired without full confirmation", cancelled.id);
                    self.after_cancel(&cancelled).await;
                    expired.push(cancelled.id);
                }
                Ok((_, false)) => {}
                Err(e) => warn!("Failed to expire match {}: {}", candidate.id, e),
            }
        }
        Ok(expired)
    }

    async fn after_cancel(&self, cancelled: &Match) {
        let reason = match &cancelled.phase {
            MatchPhase::Cancelled { reason, .. } => reason.clone(),
            _ => return,
        };
        self.metrics.record_cancellation(reason.label());
        publish_best_effort(
            self.publisher.as_ref(),
            MatchEvent::Cancelled {
                match_id: cancelled.id,
                reason: reason.to_string(),
                timestamp: current_timestamp(),
            },
        )
        .await;

        if let Some(handler) = &self.cancellation_handler {
            if let Err(e) = handler.on_cancelled(cancelled).await {
                error!(
                    "Follow-up for cancelled match {} failed: {}",
                    cancelled.id, e
                );
                self.metrics.record_error(e.category());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::error::MatchmakingError;
    use crate::matches::store::InMemoryMatchStore;
    use crate::types::GameMode;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(AtomicUsize);

    #[async_trait]
    impl CancellationHandler for CountingHandler {
        async fn on_cancelled(&self, _cancelled: &Match) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (MatchService, Arc<InMemoryMatchStore>, Arc<MockEventPublisher>, Arc<CountingHandler>) {
        let store = Arc::new(InMemoryMatchStore::new());
        let publisher = Arc::new(MockEventPublisher::new());
        let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));
        let service = MatchService::new(
            store.clone(),
            publisher.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
            LifecycleConfig::default(),
        )
        .with_cancellation_handler(handler.clone());
        (service, store, publisher, handler)
    }

    fn insert_duel(store: &InMemoryMatchStore, now: DateTime<Utc>) -> MatchId {
        let lifecycle = LifecycleConfig::default();
        let m = Match::new(
            GameMode::OneVsOne,
            vec!["a".to_string()],
            vec!["b".to_string()],
            lifecycle.map_pool.clone(),
            lifecycle.location_pool.clone(),
            now,
            now + lifecycle.confirmation_timeout(),
        );
        let id = m.id;
        store.insert(m).unwrap();
        id
    }

    #[tokio::test]
    async fn test_confirm_publishes_once() {
        let (service, store, publisher, _) = setup();
        let id = insert_duel(&store, Utc::now());

        service.confirm(id, "a").await.unwrap();
        assert_eq!(
            service.confirm(id, "b").await.unwrap(),
            ConfirmOutcome::Transitioned
        );
        assert_eq!(
            service.confirm(id, "b").await.unwrap(),
            ConfirmOutcome::AlreadyConfirmed
        );
        assert_eq!(publisher.count("confirmed"), 1);
        assert_eq!(service.get(id).unwrap().state(), MatchStateKind::Veto);
    }

    #[tokio::test]
    async fn test_decline_runs_cancellation_handler() {
        let (service, store, publisher, handler) = setup();
        let id = insert_duel(&store, Utc::now());

        let cancelled = service.decline(id, "b").await.unwrap();
        assert_eq!(cancelled.state(), MatchStateKind::Cancelled);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.count("cancelled"), 1);
        assert!(service.active_match_for("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expire_confirmations() {
        let (service, store, _, handler) = setup();
        let long_ago = Utc::now() - Duration::seconds(60);
        let stale = insert_duel(&store, long_ago);

        let fresh = Match::new(
            GameMode::OneVsOne,
            vec!["c".to_string()],
            vec!["d".to_string()],
            vec!["m".to_string()],
            vec!["l".to_string()],
            Utc::now(),
            Utc::now() + Duration::seconds(20),
        );
        let fresh_id = fresh.id;
        store.insert(fresh).unwrap();

        let expired = service.expire_confirmations(Utc::now()).await.unwrap();
        assert_eq!(expired, vec![stale]);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
        assert_eq!(
            service.get(fresh_id).unwrap().state(),
            MatchStateKind::Confirming
        );
        assert!(matches!(
            service.confirm(stale, "a").await,
            Err(MatchmakingError::WrongMatchState { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_veto_publishes_completion() {
        let (service, store, publisher, _) = setup();
        let id = insert_duel(&store, Utc::now());
        service.confirm(id, "a").await.unwrap();
        service.confirm(id, "b").await.unwrap();

        let maps = LifecycleConfig::default().map_pool;
        for (i, map) in maps.iter().take(maps.len() - 1).enumerate() {
            let user = if i % 2 == 0 { "a" } else { "b" };
            service.ban(id, user, VetoKind::Map, map).await.unwrap();
        }
        let locations = LifecycleConfig::default().location_pool;
        for (i, location) in locations.iter().take(locations.len() - 1).enumerate() {
            let user = if i % 2 == 0 { "a" } else { "b" };
            service
                .ban(id, user, VetoKind::Location, location)
                .await
                .unwrap();
        }

        let m = service.get(id).unwrap();
        assert_eq!(m.state(), MatchStateKind::Configuring);
        let setup = m.setup().unwrap();
        assert_eq!(&setup.map, maps.last().unwrap());
        assert_eq!(&setup.location, locations.last().unwrap());
        assert_eq!(publisher.count("veto_completed"), 1);
    }
}
