//! Wire shapes of the game-server provider API

use crate::types::MatchId;
use serde::{Deserialize, Serialize};

/// Provider team label for our team A
pub const TEAM_A_LABEL: &str = "team1";
/// Provider team label for our team B
pub const TEAM_B_LABEL: &str = "team2";

/// Request to create a dedicated server for a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub match_id: MatchId,
    pub map: String,
    pub location: String,
    pub team1_steam_ids: Vec<String>,
    pub team2_steam_ids: Vec<String>,
}

/// Server handed back by the provider once it is ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAssignment {
    pub server_id: String,
    /// Id of the provider-side match resource polled by ingestion
    pub provider_match_id: String,
    pub ip: String,
    pub port: u16,
}

impl ServerAssignment {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Provider match resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMatch {
    pub id: String,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub players: Vec<ProviderPlayer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPlayer {
    pub steam_id_64: String,
    pub team: String,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub stats: ProviderPlayerStats,
}

/// Per-player counters. `score` is the in-game point total, not rounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPlayerStats {
    pub kills: u32,
    pub deaths: u32,
    pub assists: u32,
    pub mvps: u32,
    pub score: u32,
    pub headshots: u32,
}
