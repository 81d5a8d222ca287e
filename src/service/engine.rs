//! Engine wiring
//!
//! Builds every engine component over a set of stores and exposes the
//! operations the command consumer and the background jobs drive.

use crate::admin::AdminService;
use crate::amqp::publisher::EventPublisher;
use crate::audit::{AuditLog, InMemoryAuditLog};
use crate::auth::StaticAuthorizationPolicy;
use crate::config::AppConfig;
use crate::error::Result;
use crate::history::{HistoryQueries, InMemoryHistoryStore, MatchHistoryStore, PlayerStatStore};
use crate::ingestion::{IngestionJob, IngestionScheduler};
use crate::matches::{
    FifoPairingPolicy, InMemoryMatchStore, MatchService, MatchStateKind, MatchStore,
    MatchmakingCoordinator, PairingPolicy, ProvisioningCoordinator,
};
use crate::metrics::MetricsCollector;
use crate::provider::GameServerProvider;
use crate::queue::{
    InMemoryPartyDirectory, InMemoryQueueStore, PartyDirectory, QueueService, QueueStore,
};
use crate::settlement::{EloCalculator, SettlementEngine};
use crate::trust::TrustService;
use crate::types::{GameMode, MatchId, PlayerAction, PlayerCommand};
use crate::users::{InMemoryUserStore, UserStore};
use crate::utils::current_timestamp;
use crate::wager::WagerLedger;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Storage the engine runs on
#[derive(Clone)]
pub struct EngineStores {
    pub users: Arc<dyn UserStore>,
    pub parties: Arc<dyn PartyDirectory>,
    pub queue: Arc<dyn QueueStore>,
    pub matches: Arc<dyn MatchStore>,
    pub stats: Arc<dyn PlayerStatStore>,
    pub history: Arc<dyn MatchHistoryStore>,
    pub audit: Arc<dyn AuditLog>,
}

impl EngineStores {
    pub fn in_memory() -> Self {
        let history = Arc::new(InMemoryHistoryStore::new());
        Self {
            users: Arc::new(InMemoryUserStore::new()),
            parties: Arc::new(InMemoryPartyDirectory::new()),
            queue: Arc::new(InMemoryQueueStore::new()),
            matches: Arc::new(InMemoryMatchStore::new()),
            stats: history.clone(),
            history,
            audit: Arc::new(InMemoryAuditLog::new()),
        }
    }
}

/// Point-in-time counters for health and stats endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub players_waiting: BTreeMap<String, usize>,
    pub matches_by_state: BTreeMap<String, usize>,
    pub ingestion_tracked: usize,
    pub open_wagers: u64,
    pub disputed_wagers: u64,
}

pub struct Engine {
    config: AppConfig,
    stores: EngineStores,
    metrics: Arc<MetricsCollector>,
    queue: QueueService,
    matches: MatchService,
    matchmaker: MatchmakingCoordinator,
    provisioning: ProvisioningCoordinator,
    settlement: Arc<SettlementEngine>,
    ledger: Arc<WagerLedger>,
    ingestion: Arc<IngestionScheduler>,
    admin: AdminService,
    trust: Arc<TrustService>,
    queries: HistoryQueries,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        stores: EngineStores,
        publisher: Arc<dyn EventPublisher>,
        provider: Arc<dyn GameServerProvider>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        Self::with_policy(
            config,
            stores,
            publisher,
            provider,
            metrics,
            Arc::new(FifoPairingPolicy::new()),
        )
    }

    /// Build with a custom pairing heuristic
    pub fn with_policy(
        config: AppConfig,
        stores: EngineStores,
        publisher: Arc<dyn EventPublisher>,
        provider: Arc<dyn GameServerProvider>,
        metrics: Arc<MetricsCollector>,
        policy: Arc<dyn PairingPolicy>,
    ) -> Result<Self> {
        let lifecycle = config.lifecycle.clone();
        let trust = Arc::new(TrustService::new(stores.users.clone()));
        let ledger = Arc::new(WagerLedger::new(
            stores.users.clone(),
            stores.matches.clone(),
            metrics.clone(),
            u64::from(config.wager.platform_fee_bps),
        ));
        let settlement = Arc::new(
            SettlementEngine::new(
                stores.matches.clone(),
                stores.users.clone(),
                stores.stats.clone(),
                stores.history.clone(),
                ledger.clone(),
                provider.clone(),
                publisher.clone(),
                metrics.clone(),
                EloCalculator::new(config.rating.clone())?,
            )
            .with_trust(trust.clone()),
        );
        let matches = MatchService::new(
            stores.matches.clone(),
            publisher.clone(),
            metrics.clone(),
            lifecycle.clone(),
        )
        .with_cancellation_handler(settlement.clone());

        let ingestion = Arc::new(IngestionScheduler::new(
            Arc::new(IngestionJob::new(
                stores.matches.clone(),
                stores.users.clone(),
                stores.stats.clone(),
                provider.clone(),
                matches.clone(),
                settlement.clone(),
                metrics.clone(),
            )),
            lifecycle.poll_interval(),
        ));
        let provisioning = ProvisioningCoordinator::new(
            stores.matches.clone(),
            stores.users.clone(),
            stores.stats.clone(),
            provider,
            publisher.clone(),
            metrics.clone(),
            lifecycle.warmup_timeout(),
        )
        .with_ingestion(ingestion.clone());

        let queue = QueueService::new(
            stores.queue.clone(),
            stores.users.clone(),
            stores.parties.clone(),
            stores.matches.clone(),
            publisher.clone(),
            metrics.clone(),
        );
        let matchmaker = MatchmakingCoordinator::new(
            stores.queue.clone(),
            stores.matches.clone(),
            policy,
            publisher.clone(),
            metrics.clone(),
            lifecycle,
        );
        let admin = AdminService::new(
            Arc::new(StaticAuthorizationPolicy::from_settings(
                &config.authorization,
            )),
            stores.audit.clone(),
            matches.clone(),
            settlement.clone(),
            publisher,
        )
        .with_ingestion(ingestion.clone());
        let queries = HistoryQueries::new(stores.history.clone(), stores.stats.clone());

        Ok(Self {
            config,
            stores,
            metrics,
            queue,
            matches,
            matchmaker,
            provisioning,
            settlement,
            ledger,
            ingestion,
            admin,
            trust,
            queries,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn stores(&self) -> &EngineStores {
        &self.stores
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn queue(&self) -> &QueueService {
        &self.queue
    }

    pub fn matches(&self) -> &MatchService {
        &self.matches
    }

    pub fn matchmaker(&self) -> &MatchmakingCoordinator {
        &self.matchmaker
    }

    pub fn provisioning(&self) -> &ProvisioningCoordinator {
        &self.provisioning
    }

    pub fn settlement(&self) -> &Arc<SettlementEngine> {
        &self.settlement
    }

    pub fn ledger(&self) -> &Arc<WagerLedger> {
        &self.ledger
    }

    pub fn ingestion(&self) -> &Arc<IngestionScheduler> {
        &self.ingestion
    }

    pub fn admin(&self) -> &AdminService {
        &self.admin
    }

    pub fn trust(&self) -> &Arc<TrustService> {
        &self.trust
    }

    pub fn history(&self) -> &HistoryQueries {
        &self.queries
    }

    /// Run one player command as the stamped user
    pub async fn execute(&self, command: PlayerCommand) -> Result<()> {
        let started = Instant::now();
        let user = command.user_id.as_str();
        let operation = match command.action {
            PlayerAction::JoinQueue { mode } => {
                self.queue.join(user, mode).await?;
                "join_queue"
            }
            PlayerAction::LeaveQueue => {
                self.queue.leave(user).await?;
                "leave_queue"
            }
            PlayerAction::Confirm { match_id } => {
                self.matches.confirm(match_id, user).await?;
                "confirm"
            }
            PlayerAction::Decline { match_id } => {
                self.matches.decline(match_id, user).await?;
                "decline"
            }
            PlayerAction::Ban {
                match_id,
                kind,
                item,
            } => {
                let outcome = self.matches.ban(match_id, user, kind, &item).await?;
                if outcome.completed.is_some() {
                    self.spawn_provisioning(match_id);
                }
                "ban"
            }
            PlayerAction::RequestProvisioning { match_id } => {
                let response = self
                    .provisioning
                    .request_provisioning(match_id, user)
                    .await?;
                debug!("Provisioning request by {}: {:?}", user, response);
                "request_provisioning"
            }
        };
        self.metrics.record_operation(operation, started.elapsed());
        Ok(())
    }

    /// Provision in the background once the veto resolves. Racing player
    /// requests are absorbed by the provisioning lock.
    fn spawn_provisioning(&self, match_id: MatchId) {
        let coordinator = self.provisioning.clone();
        tokio::spawn(async move {
            match coordinator.provision(match_id).await {
                Ok(response) => debug!("Provisioning of {} returned {:?}", match_id, response),
                Err(e) => error!("Provisioning of {} failed: {}", match_id, e),
            }
        });
    }

    /// Form as many matches as the queues allow. Returns how many were created.
    pub async fn run_matchmaking(&self) -> Result<usize> {
        let mut created = 0;
        for mode in GameMode::ALL {
            while let Some(m) = self.matchmaker.run_once(mode).await? {
                debug!("Matchmaker formed {} match {}", mode, m.id);
                created += 1;
            }
            self.metrics
                .update_queue_depth(mode, self.queue.count_by_mode(mode)?);
        }
        if created > 0 {
            info!("Matchmaker created {} match(es)", created);
        }
        Ok(created)
    }

    pub async fn sweep_confirmations(&self) -> Result<Vec<MatchId>> {
        self.matches.expire_confirmations(current_timestamp()).await
    }

    pub fn reconcile_provisioning(&self) -> Result<Vec<MatchId>> {
        self.provisioning.lock().reconcile_stale(
            current_timestamp(),
            self.config.lifecycle.provisioning_stale_after(),
        )
    }

    pub fn snapshot(&self) -> Result<EngineSnapshot> {
        let mut snapshot = EngineSnapshot {
            ingestion_tracked: self.ingestion.tracked(),
            ..EngineSnapshot::default()
        };
        for mode in GameMode::ALL {
            snapshot
                .players_waiting
                .insert(mode.to_string(), self.queue.count_by_mode(mode)?);
        }
        let counts = self.stores.matches.count_by_state()?;
        for state in MatchStateKind::ALL {
            snapshot.matches_by_state.insert(
                state.to_string(),
                counts.get(&state).copied().unwrap_or(0),
            );
        }
        let revenue = self.ledger.revenue_stats()?;
        snapshot.open_wagers = revenue.open_wagers;
        snapshot.disputed_wagers = revenue.disputed_wagers;
        Ok(snapshot)
    }

    /// Push queue depth and per-state match counts to the gauges
    pub fn refresh_metrics(&self) -> Result<()> {
        for mode in GameMode::ALL {
            self.metrics
                .update_queue_depth(mode, self.queue.count_by_mode(mode)?);
        }
        self.metrics
            .update_match_states(&self.stores.matches.count_by_state()?);
        Ok(())
    }
}
