//! Server provisioning lock and coordinator
//!
//! The lock is one atomic transition on the match: `Configuring` with
//! provisioning not started becomes `Started` and the caller gets
//! [`ProvisioningDecision::Acquired`]. Every other caller sees
//! `AlreadyProvisioning` and must not contact the provider.

use crate::amqp::publisher::{publish_best_effort, EventPublisher};
use crate::error::{MatchmakingError, Result};
use crate::history::{PlayerStat, PlayerStatStore};
use crate::ingestion::IngestionScheduler;
use crate::matches::state::{LiveFeed, Match, MatchPhase, MatchStateKind, ProvisioningStatus};
use crate::matches::store::{require_match, transition, MatchStore};
use crate::metrics::MetricsCollector;
use crate::provider::{GameServerProvider, ServerAssignment, ServerSpec};
use crate::types::{MatchEvent, MatchId, TeamSide};
use crate::users::UserStore;
use crate::utils::current_timestamp;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningDecision {
    Acquired,
    AlreadyProvisioning,
}

/// Caller-facing answer to a provisioning request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<ProvisioningDecision> for ProvisioningResponse {
    fn from(decision: ProvisioningDecision) -> Self {
        match decision {
            ProvisioningDecision::Acquired => Self {
                success: true,
                reason: None,
            },
            ProvisioningDecision::AlreadyProvisioning => Self {
                success: false,
                reason: Some("already_provisioning".to_string()),
            },
        }
    }
}

/// Atomic guard around server creation
#[derive(Clone)]
pub struct ProvisioningLock {
    store: Arc<dyn MatchStore>,
}

impl ProvisioningLock {
    pub fn new(store: Arc<dyn MatchStore>) -> Self {
        Self { store }
    }

    /// Try to take the lock. Single read-modify-write on the match.
    pub fn request(&self, match_id: MatchId, now: DateTime<Utc>) -> Result<ProvisioningDecision> {
        let (_, decision) = transition(self.store.as_ref(), match_id, |m| match &mut m.phase {
            MatchPhase::Configuring { provisioning, .. } => match provisioning {
                ProvisioningStatus::NotStarted => {
                    *provisioning = ProvisioningStatus::Started { since: now };
                    Ok(ProvisioningDecision::Acquired)
                }
                ProvisioningStatus::Started { .. } => Ok(ProvisioningDecision::AlreadyProvisioning),
            },
            MatchPhase::Warmup { .. } | MatchPhase::Live { .. } => {
                Ok(ProvisioningDecision::AlreadyProvisioning)
            }
            _ => Err(m.wrong_state("CONFIGURING")),
        })?;
        Ok(decision)
    }

    /// Attach the ready server and start warmup
    pub fn complete(
        &self,
        match_id: MatchId,
        server: ServerAssignment,
        now: DateTime<Utc>,
        warmup_timeout: Duration,
    ) -> Result<Match> {
        let (warming_up, _) = transition(self.store.as_ref(), match_id, |m| {
            let setup = match &m.phase {
                MatchPhase::Configuring {
                    setup,
                    provisioning: ProvisioningStatus::Started { .. },
                } => setup.clone(),
                MatchPhase::Configuring { .. } => {
                    return Err(MatchmakingError::ProvisioningNotStarted { match_id })
                }
                _ => return Err(m.wrong_state("CONFIGURING")),
            };
            m.phase = MatchPhase::Warmup {
                setup,
                server: server.clone(),
                deadline: now + warmup_timeout,
                feed: LiveFeed::default(),
            };
            Ok(())
        })?;
        Ok(warming_up)
    }

    /// Give the lock back so provisioning can be retried. Returns false when
    /// the lock was not held.
    pub fn release(&self, match_id: MatchId) -> Result<bool> {
        let (_, released) = transition(self.store.as_ref(), match_id, |m| match &mut m.phase {
            MatchPhase::Configuring { provisioning, .. } => {
                let held = matches!(provisioning, ProvisioningStatus::Started { .. });
                *provisioning = ProvisioningStatus::NotStarted;
                Ok(held)
            }
            _ => Err(m.wrong_state("CONFIGURING")),
        })?;
        Ok(released)
    }

    /// Matches holding the lock for longer than `threshold` without a server
    pub fn stuck(&self, now: DateTime<Utc>, threshold: Duration) -> Result<Vec<MatchId>> {
        Ok(self
            .store
            .list_by_state(MatchStateKind::Configuring)?
            .into_iter()
            .filter(|m| match &m.phase {
                MatchPhase::Configuring {
                    provisioning: ProvisioningStatus::Started { since },
                    ..
                } => now - *since >= threshold,
                _ => false,
            })
            .map(|m| m.id)
            .collect())
    }

    /// Release every stuck lock. The age is re-checked inside the transition
    /// so a lock re-acquired in the meantime is left alone.
    pub fn reconcile_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Result<Vec<MatchId>> {
        let mut released = Vec::new();
        for match_id in self.stuck(now, threshold)? {
            let result = transition(self.store.as_ref(), match_id, |m| match &mut m.phase {
                MatchPhase::Configuring { provisioning, .. } => match provisioning {
                    ProvisioningStatus::Started { since } if now - *since >= threshold => {
                        *provisioning = ProvisioningStatus::NotStarted;
                        Ok(true)
                    }
                    _ => Ok(false),
                },
                _ => Ok(false),
            });
            match result {
                Ok((_, true)) => {
                    warn!("Released stale provisioning lock on match {}", match_id);
                    released.push(match_id);
                }
                Ok((_, false)) => {}
                Err(e) => warn!("Failed to reconcile match {}: {}", match_id, e),
            }
        }
        Ok(released)
    }
}

/// Runs the provisioning flow: lock, create server, attach it, seed stats,
/// start ingestion.
#[derive(Clone)]
pub struct ProvisioningCoordinator {
    lock: ProvisioningLock,
    store: Arc<dyn MatchStore>,
    users: Arc<dyn UserStore>,
    stats: Arc<dyn PlayerStatStore>,
    provider: Arc<dyn GameServerProvider>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
    warmup_timeout: Duration,
    ingestion: Option<Arc<IngestionScheduler>>,
}

impl ProvisioningCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MatchStore>,
        users: Arc<dyn UserStore>,
        stats: Arc<dyn PlayerStatStore>,
        provider: Arc<dyn GameServerProvider>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
        warmup_timeout: Duration,
    ) -> Self {
        Self {
            lock: ProvisioningLock::new(store.clone()),
            store,
            users,
            stats,
            provider,
            publisher,
            metrics,
            warmup_timeout,
            ingestion: None,
        }
    }

    pub fn with_ingestion(mut self, scheduler: Arc<IngestionScheduler>) -> Self {
        self.ingestion = Some(scheduler);
        self
    }

    pub fn lock(&self) -> &ProvisioningLock {
        &self.lock
    }

    /// Player-initiated provisioning; the caller must be a participant
    pub async fn request_provisioning(
        &self,
        match_id: MatchId,
        user_id: &str,
    ) -> Result<ProvisioningResponse> {
        require_match(self.store.as_ref(), match_id)?.require_participant(user_id)?;
        self.provision(match_id).await
    }

    pub async fn provision(&self, match_id: MatchId) -> Result<ProvisioningResponse> {
        let decision = self.lock.request(match_id, current_timestamp())?;
        if decision == ProvisioningDecision::AlreadyProvisioning {
            debug!("Match {} is already provisioning", match_id);
            self.metrics.record_provisioning("already_provisioning");
            return Ok(decision.into());
        }
        self.metrics.record_provisioning("acquired");
        info!("Provisioning lock acquired for match {}", match_id);

        let spec = match self.server_spec(match_id) {
            Ok(spec) => spec,
            Err(e) => {
                self.release_after_failure(match_id, &e);
                return Err(e);
            }
        };

        let started = Instant::now();
        let server = match self.provider.create_server(&spec).await {
            Ok(server) => {
                self.metrics
                    .record_provider_request("create_server", true, started.elapsed());
                server
            }
            Err(e) => {
                self.metrics
                    .record_provider_request("create_server", false, started.elapsed());
                self.release_after_failure(match_id, &e);
                return Err(match e {
                    MatchmakingError::ExternalProvider { .. }
                    | MatchmakingError::MissingCredentials { .. } => e,
                    other => MatchmakingError::ExternalProvider {
                        message: other.to_string(),
                    },
                });
            }
        };

        let now = current_timestamp();
        let warming_up =
            match self
                .lock
                .complete(match_id, server.clone(), now, self.warmup_timeout)
            {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        "Match {} moved on while server {} was created ({}), deleting it",
                        match_id, server.server_id, e
                    );
                    if let Err(delete_err) = self.provider.delete_server(&server.server_id).await {
                        error!(
                            "Failed to delete orphaned server {}: {}",
                            server.server_id, delete_err
                        );
                    }
                    return Err(e);
                }
            };

        let placeholders = [TeamSide::A, TeamSide::B]
            .into_iter()
            .flat_map(|side| {
                warming_up
                    .team(side)
                    .iter()
                    .map(move |user| PlayerStat::placeholder(match_id, user.clone(), side))
            })
            .collect();
        self.stats.seed(placeholders)?;

        info!(
            "Server {} ready for match {} at {}",
            server.server_id,
            match_id,
            server.address()
        );
        self.metrics.record_provisioning("ready");
        self.metrics.record_transition(MatchStateKind::Warmup);
        publish_best_effort(
            self.publisher.as_ref(),
            MatchEvent::ServerReady {
                match_id,
                server_ip: server.address(),
                timestamp: now,
            },
        )
        .await;

        if let Some(scheduler) = &self.ingestion {
            scheduler.start(match_id)?;
        }

        Ok(decision.into())
    }

    fn server_spec(&self, match_id: MatchId) -> Result<ServerSpec> {
        let m = require_match(self.store.as_ref(), match_id)?;
        let setup = m.setup().cloned().ok_or_else(|| m.wrong_state("CONFIGURING"))?;
        let users = self.users.get_many(&m.participant_ids())?;

        let steam_ids = |team: &[String]| -> Result<Vec<String>> {
            team.iter()
                .map(|id| {
                    users
                        .get(id)
                        .and_then(|u| u.steam_id.clone())
                        .ok_or_else(|| MatchmakingError::MissingLinkedIdentity {
                            user_id: id.clone(),
                        })
                })
                .collect()
        };

        Ok(ServerSpec {
            match_id,
            map: setup.map,
            location: setup.location,
            team1_steam_ids: steam_ids(&m.team_a)?,
            team2_steam_ids: steam_ids(&m.team_b)?,
        })
    }

    fn release_after_failure(&self, match_id: MatchId, cause: &MatchmakingError) {
        error!("Provisioning failed for match {}: {}", match_id, cause);
        self.metrics.record_provisioning("failed");
        match self.lock.release(match_id) {
            Ok(_) => self.metrics.record_provisioning("released"),
            Err(e) => error!(
                "Could not release provisioning lock on match {}: {}",
                match_id, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matches::store::InMemoryMatchStore;
    use crate::matches::state::MatchSetup;
    use crate::types::GameMode;

    fn configuring_match(store: &InMemoryMatchStore) -> MatchId {
        let now = Utc::now();
        let mut m = Match::new(
            GameMode::OneVsOne,
            vec!["a".to_string()],
            vec!["b".to_string()],
            vec!["de_nuke".to_string()],
            vec!["frankfurt".to_string()],
            now,
            now + Duration::seconds(20),
        );
        m.phase = MatchPhase::Configuring {
            setup: MatchSetup {
                map: "de_nuke".to_string(),
                location: "frankfurt".to_string(),
            },
            provisioning: ProvisioningStatus::NotStarted,
        };
        let id = m.id;
        store.insert(m).unwrap();
        id
    }

    fn server() -> ServerAssignment {
        ServerAssignment {
            server_id: "srv".to_string(),
            provider_match_id: "pm".to_string(),
            ip: "10.0.0.1".to_string(),
            port: 27015,
        }
    }

    #[test]
    fn test_lock_is_taken_once() {
        let store = Arc::new(InMemoryMatchStore::new());
        let id = configuring_match(&store);
        let lock = ProvisioningLock::new(store.clone());
        let now = Utc::now();

        assert_eq!(lock.request(id, now).unwrap(), ProvisioningDecision::Acquired);
        assert_eq!(
            lock.request(id, now).unwrap(),
            ProvisioningDecision::AlreadyProvisioning
        );
        let response: ProvisioningResponse = ProvisioningDecision::AlreadyProvisioning.into();
        assert_eq!(response.reason.as_deref(), Some("already_provisioning"));
    }

    #[test]
    fn test_complete_requires_lock() {
        let store = Arc::new(InMemoryMatchStore::new());
        let id = configuring_match(&store);
        let lock = ProvisioningLock::new(store.clone());
        let now = Utc::now();

        assert_eq!(
            lock.complete(id, server(), now, Duration::seconds(300)),
            Err(MatchmakingError::ProvisioningNotStarted { match_id: id })
        );
        lock.request(id, now).unwrap();
        let m = lock
            .complete(id, server(), now, Duration::seconds(300))
            .unwrap();
        assert_eq!(m.state(), MatchStateKind::Warmup);
        assert_eq!(m.server(), Some(&server()));

        // a server is attached, so the lock can never be taken again
        assert_eq!(
            lock.request(id, now).unwrap(),
            ProvisioningDecision::AlreadyProvisioning
        );
    }

    #[test]
    fn test_reconcile_releases_only_stale_locks() {
        let store = Arc::new(InMemoryMatchStore::new());
        let stale = configuring_match(&store);
        let fresh = {
            let now = Utc::now();
            let mut m = Match::new(
                GameMode::OneVsOne,
                vec!["c".to_string()],
                vec!["d".to_string()],
                vec!["de_nuke".to_string()],
                vec!["frankfurt".to_string()],
                now,
                now,
            );
            m.phase = MatchPhase::Configuring {
                setup: MatchSetup {
                    map: "de_nuke".to_string(),
                    location: "frankfurt".to_string(),
                },
                provisioning: ProvisioningStatus::NotStarted,
            };
            let id = m.id;
            store.insert(m).unwrap();
            id
        };
        let lock = ProvisioningLock::new(store.clone());
        let now = Utc::now();

        lock.request(stale, now - Duration::minutes(10)).unwrap();
        lock.request(fresh, now).unwrap();

        let threshold = Duration::minutes(3);
        assert_eq!(lock.stuck(now, threshold).unwrap(), vec![stale]);
        assert_eq!(lock.reconcile_stale(now, threshold).unwrap(), vec![stale]);
        assert_eq!(lock.request(stale, now).unwrap(), ProvisioningDecision::Acquired);
        assert!(lock.reconcile_stale(now, threshold).unwrap().is_empty());
    }

    #[test]
    fn test_request_in_wrong_state() {
        let store = Arc::new(InMemoryMatchStore::new());
        let now = Utc::now();
        let m = Match::new(
            GameMode::OneVsOne,
            vec!["a".to_string()],
            vec!["b".to_string()],
            vec!["x".to_string()],
            vec!["y".to_string()],
            now,
            now,
        );
        let id = m.id;
        store.insert(m).unwrap();
        let lock = ProvisioningLock::new(store);
        assert!(matches!(
            lock.request(id, now),
            Err(MatchmakingError::WrongMatchState { .. })
        ));
    }
}
