//! Elo rating update using the skillratings crate
//!
//! Each player is rated against the average rating of the opposing team,
//! with a K-factor that depends on how many rated games they have in the
//! mode. Ratings are rounded to integers and never cross the configured
//! floor.

use crate::config::RatingConfig;
use crate::error::{MatchmakingError, Result};
use crate::types::{RatingChange, TeamSide, UserId};
use crate::utils::average_rating;
use skillratings::elo::{elo, expected_score, EloConfig, EloRating};
use skillratings::Outcomes;

/// A participant as seen by the calculator
#[derive(Debug, Clone, PartialEq)]
pub struct RatedPlayer {
    pub user_id: UserId,
    pub side: TeamSide,
    pub elo: i32,
    pub games_played: u32,
}

#[derive(Debug, Clone)]
pub struct EloCalculator {
    config: RatingConfig,
}

impl EloCalculator {
    pub fn new(config: RatingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RatingConfig {
        &self.config
    }

    /// Average rating of one side
    pub fn team_average(players: &[RatedPlayer], side: TeamSide) -> f64 {
        let ratings: Vec<i32> = players
            .iter()
            .filter(|p| p.side == side)
            .map(|p| p.elo)
            .collect();
        average_rating(&ratings)
    }

    /// Win probability of `side` against the other team
    pub fn win_probability(players: &[RatedPlayer], side: TeamSide) -> f64 {
        let (expected, _) = expected_score(
            &EloRating {
                rating: Self::team_average(players, side),
            },
            &EloRating {
                rating: Self::team_average(players, side.opponent()),
            },
        );
        expected
    }

    /// Rating changes for every player, in input order
    pub fn rate(&self, players: &[RatedPlayer], winner: TeamSide) -> Result<Vec<RatingChange>> {
        for side in [TeamSide::A, TeamSide::B] {
            if !players.iter().any(|p| p.side == side) {
                return Err(MatchmakingError::InvalidOutcome {
                    reason: format!("team {} has no rated players", side),
                });
            }
        }
        let averages = [
            Self::team_average(players, TeamSide::A),
            Self::team_average(players, TeamSide::B),
        ];

        Ok(players
            .iter()
            .map(|player| {
                let opponent_average = match player.side {
                    TeamSide::A => averages[1],
                    TeamSide::B => averages[0],
                };
                let won = player.side == winner;
                let outcome = if won { Outcomes::WIN } else { Outcomes::LOSS };
                let config = EloConfig {
                    k: self.config.k_factor(player.games_played),
                };
                let (updated, _) = elo(
                    &EloRating {
                        rating: f64::from(player.elo),
                    },
                    &EloRating {
                        rating: opponent_average,
                    },
                    &outcome,
                    &config,
                );

                let mut new_elo = (updated.rating.round() as i32).max(self.config.min_elo);
                // a win never costs rating and a loss never gains any
                new_elo = if won {
                    new_elo.max(player.elo)
                } else {
                    new_elo.min(player.elo)
                };
                RatingChange {
                    user_id: player.user_id.clone(),
                    old_elo: player.elo,
                    new_elo,
                    elo_change: new_elo - player.elo,
                }
            })
            .collect())
    }
}
