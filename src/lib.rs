//! Matchforge - match lifecycle and settlement engine
//!
//! Takes players from a per-mode queue through confirmation, map/location
//! veto, game-server provisioning and live stat ingestion to a settled
//! result with Elo updates, match history and wager payouts. Player
//! commands arrive over AMQP; lifecycle events are published back out.

pub mod admin;
pub mod amqp;
pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod history;
pub mod ingestion;
pub mod matches;
pub mod metrics;
pub mod provider;
pub mod queue;
pub mod service;
pub mod settlement;
pub mod trust;
pub mod types;
pub mod users;
pub mod utils;
pub mod wager;

pub use error::{ErrorCategory, MatchmakingError, Result};
pub use types::*;

pub use amqp::publisher::EventPublisher;
pub use matches::{Match, MatchService, MatchStore};
pub use service::{Engine, EngineStores};
pub use settlement::SettlementEngine;
pub use wager::WagerLedger;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
