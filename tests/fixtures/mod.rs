//! Shared harness for the integration tests
//!
//! Builds a full engine over in-memory stores with the recording event
//! publisher and the in-process game server provider.

#![allow(dead_code)]

use matchforge::amqp::publisher::MockEventPublisher;
use matchforge::auth::Capability;
use matchforge::config::AppConfig;
use matchforge::history::MatchHistoryStore;
use matchforge::matches::{Match, MatchStateKind};
use matchforge::metrics::MetricsCollector;
use matchforge::provider::{
    GameServerProvider, MockGameServerProvider, ProviderMatch, ProviderPlayer,
};
use matchforge::provider::types::ProviderPlayerStats;
use matchforge::queue::{InMemoryPartyDirectory, Party};
use matchforge::service::{Engine, EngineStores};
use matchforge::types::{GameMode, MatchId, TeamSide, VetoKind};
use matchforge::users::{SteamSignals, User};
use std::sync::Arc;
use std::time::Duration;

pub const ADMIN: &str = "ops-admin";
pub const SUPPORT: &str = "ops-support";

pub struct TestHarness {
    pub engine: Arc<Engine>,
    pub publisher: Arc<MockEventPublisher>,
    pub provider: Arc<MockGameServerProvider>,
    pub parties: Arc<InMemoryPartyDirectory>,
}

/// Small pools so a veto takes one ban per pool, and a poll interval long
/// enough that tests drive ingestion by hand
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.lifecycle.map_pool = vec!["de_dust2".to_string(), "de_mirage".to_string()];
    config.lifecycle.location_pool = vec!["frankfurt".to_string(), "london".to_string()];
    config.lifecycle.poll_interval_seconds = 3600;
    config
        .authorization
        .roles
        .insert(ADMIN.to_string(), vec![Capability::Admin]);
    config
        .authorization
        .roles
        .insert(SUPPORT.to_string(), vec![Capability::Support]);
    config
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_provider(Arc::new(MockGameServerProvider::new()))
    }

    pub fn with_provider(provider: Arc<MockGameServerProvider>) -> Self {
        Self::build(provider, EngineStores::in_memory())
    }

    /// Swap in a history store, e.g. one that fails on demand
    pub fn with_history(history: Arc<dyn MatchHistoryStore>) -> Self {
        let mut stores = EngineStores::in_memory();
        stores.history = history;
        Self::build(Arc::new(MockGameServerProvider::new()), stores)
    }

    fn build(provider: Arc<MockGameServerProvider>, mut stores: EngineStores) -> Self {
        let parties = Arc::new(InMemoryPartyDirectory::new());
        stores.parties = parties.clone();
        let publisher = Arc::new(MockEventPublisher::new());

        let engine = Engine::new(
            test_config(),
            stores,
            publisher.clone(),
            provider.clone() as Arc<dyn GameServerProvider>,
            Arc::new(MetricsCollector::new().unwrap()),
        )
        .unwrap();

        Self {
            engine: Arc::new(engine),
            publisher,
            provider,
            parties,
        }
    }

    /// Insert a user with a linked game account and a wager balance
    pub fn seed_user(&self, id: &str, balance: u64) -> User {
        let user = User::new(id, 1000)
            .with_steam(
                steam_id(id),
                SteamSignals {
                    hours: 800,
                    account_age_years: 4.0,
                    vac_bans: 0,
                    game_bans: 0,
                },
            )
            .with_balance(balance);
        self.engine.stores().users.insert(user.clone()).unwrap();
        user
    }

    pub fn seed_party(&self, leader: &str, others: &[&str]) -> Party {
        let party = Party::new(leader, others);
        self.parties.insert(party.clone()).unwrap();
        party
    }

    pub fn get_match(&self, match_id: MatchId) -> Match {
        self.engine.matches().get(match_id).unwrap()
    }

    pub fn balance(&self, user_id: &str) -> u64 {
        self.engine
            .stores()
            .users
            .get(user_id)
            .unwrap()
            .unwrap()
            .balance
    }

    pub fn elo(&self, user_id: &str, mode: GameMode) -> i32 {
        self.engine
            .stores()
            .users
            .get(user_id)
            .unwrap()
            .unwrap()
            .elo(mode)
    }

    /// Queue both players and let the matchmaker pair them
    pub async fn create_1v1(&self, a: &str, b: &str) -> Match {
        self.engine.queue().join(a, GameMode::OneVsOne).await.unwrap();
        self.engine.queue().join(b, GameMode::OneVsOne).await.unwrap();
        self.engine
            .matchmaker()
            .run_once(GameMode::OneVsOne)
            .await
            .unwrap()
            .expect("two queued players should pair")
    }

    /// Confirm everyone and run the veto to completion
    pub async fn to_configuring(&self, created: &Match) {
        for user in created.participants() {
            self.engine.matches().confirm(created.id, user).await.unwrap();
        }
        let captain_a = created.team_a[0].clone();
        self.engine
            .matches()
            .ban(created.id, &captain_a, VetoKind::Map, "de_dust2")
            .await
            .unwrap();
        self.engine
            .matches()
            .ban(created.id, &captain_a, VetoKind::Location, "london")
            .await
            .unwrap();
        assert_eq!(
            self.get_match(created.id).state(),
            MatchStateKind::Configuring
        );
    }

    /// Provision the server; the background poll loop is stopped so the
    /// test drives every tick itself
    pub async fn to_warmup(&self, created: &Match) {
        self.to_configuring(created).await;
        self.engine.provisioning().provision(created.id).await.unwrap();
        self.engine.ingestion().stop(created.id);
        assert_eq!(self.get_match(created.id).state(), MatchStateKind::Warmup);
    }

    /// Publish a provider resource for the match
    pub fn set_feed(&self, created: &Match, feed: FeedSpec) {
        let current = self.get_match(created.id);
        let server = current.server().expect("match has a server").clone();
        let mut players = Vec::new();
        for (side, team) in [(TeamSide::A, &created.team_a), (TeamSide::B, &created.team_b)] {
            for user in team {
                let mvps = match side {
                    TeamSide::A => feed.mvps_a,
                    TeamSide::B => feed.mvps_b,
                };
                players.push(ProviderPlayer {
                    steam_id_64: steam_id(user),
                    team: match side {
                        TeamSide::A => "team1".to_string(),
                        TeamSide::B => "team2".to_string(),
                    },
                    connected: feed.connected,
                    stats: ProviderPlayerStats {
                        kills: 10,
                        deaths: 8,
                        assists: 2,
                        mvps,
                        score: 20,
                        headshots: 4,
                    },
                });
            }
        }
        self.provider.set_match(ProviderMatch {
            id: server.provider_match_id,
            finished: feed.finished,
            players,
        });
    }

    /// Wait for a background transition, failing after a second
    pub async fn wait_for_state(&self, match_id: MatchId, state: MatchStateKind) -> Match {
        for _ in 0..100 {
            let current = self.get_match(match_id);
            if current.state() == state {
                return current;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("match {} never reached {}", match_id, state);
    }
}

/// What the provider reports for every player of each team
#[derive(Debug, Clone, Copy)]
pub struct FeedSpec {
    pub connected: bool,
    pub finished: bool,
    pub mvps_a: u32,
    pub mvps_b: u32,
}

impl FeedSpec {
    pub fn warmup(connected: bool) -> Self {
        Self {
            connected,
            finished: false,
            mvps_a: 0,
            mvps_b: 0,
        }
    }

    pub fn finished(mvps_a: u32, mvps_b: u32) -> Self {
        Self {
            connected: true,
            finished: true,
            mvps_a,
            mvps_b,
        }
    }
}

pub fn steam_id(user_id: &str) -> String {
    format!("7656119{}", user_id)
}
