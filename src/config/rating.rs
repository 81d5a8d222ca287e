//! Elo rating configuration

use crate::error::{MatchmakingError, Result};
use serde::{Deserialize, Serialize};

/// Elo parameters applied at settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatingConfig {
    /// Rating assigned to accounts without rated games
    pub initial_elo: i32,
    /// K-factor while an account is provisional in a mode
    pub k_provisional: f64,
    /// K-factor once an account is established in a mode
    pub k_established: f64,
    /// Rated games after which an account stops being provisional
    pub provisional_games: u32,
    /// Lowest rating a player can fall to
    pub min_elo: i32,
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            initial_elo: 1000,
            k_provisional: 32.0,
            k_established: 20.0,
            provisional_games: 10,
            min_elo: 0,
        }
    }
}

impl RatingConfig {
    /// K-factor for a player with `games_played` rated games in the mode
    pub fn k_factor(&self, games_played: u32) -> f64 {
        if games_played < self.provisional_games {
            self.k_provisional
        } else {
            self.k_established
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.k_provisional <= 0.0 || self.k_established <= 0.0 {
            return Err(MatchmakingError::ConfigurationError {
                message: "K-factors must be positive".to_string(),
            });
        }
        if self.k_established > self.k_provisional {
            return Err(MatchmakingError::ConfigurationError {
                message: "Established K-factor cannot exceed the provisional one".to_string(),
            });
        }
        if self.initial_elo < self.min_elo {
            return Err(MatchmakingError::ConfigurationError {
                message: "Initial rating cannot be below the rating floor".to_string(),
            });
        }
        Ok(())
    }
}
