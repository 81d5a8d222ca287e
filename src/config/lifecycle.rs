//! Match lifecycle timing and veto pool configuration

use crate::error::{MatchmakingError, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Timeouts, poll intervals and veto pools for the match state machine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Window in which every participant must accept a found match
    pub confirmation_timeout_seconds: u64,
    /// Window in which every participant must connect to the server
    pub warmup_timeout_seconds: u64,
    /// Age after which a provisioning lock without a server is released
    pub provisioning_stale_seconds: u64,
    /// Interval between polls of the provider match resource
    pub poll_interval_seconds: u64,
    /// Interval of the confirmation and provisioning sweepers
    pub sweep_interval_seconds: u64,
    /// Interval of the matchmaker tick
    pub matchmaking_interval_seconds: u64,
    /// Maps offered to the veto
    pub map_pool: Vec<String>,
    /// Server locations offered to the veto
    pub location_pool: Vec<String>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_seconds: 20,
            warmup_timeout_seconds: 300,
            provisioning_stale_seconds: 180,
            poll_interval_seconds: 5,
            sweep_interval_seconds: 2,
            matchmaking_interval_seconds: 3,
            map_pool: [
                "de_dust2",
                "de_mirage",
                "de_inferno",
                "de_nuke",
                "de_overpass",
                "de_ancient",
                "de_anubis",
            ]
            .iter()
            .map(|m| m.to_string())
            .collect(),
            location_pool: ["frankfurt", "amsterdam", "stockholm", "warsaw", "london"]
                .iter()
                .map(|l| l.to_string())
                .collect(),
        }
    }
}

impl LifecycleConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::seconds(self.confirmation_timeout_seconds as i64)
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::seconds(self.warmup_timeout_seconds as i64)
    }

    pub fn provisioning_stale_after(&self) -> Duration {
        Duration::seconds(self.provisioning_stale_seconds as i64)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn matchmaking_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.matchmaking_interval_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        let timings = [
            ("confirmation timeout", self.confirmation_timeout_seconds),
            ("warmup timeout", self.warmup_timeout_seconds),
            ("provisioning stale threshold", self.provisioning_stale_seconds),
            ("poll interval", self.poll_interval_seconds),
            ("sweep interval", self.sweep_interval_seconds),
            ("matchmaking interval", self.matchmaking_interval_seconds),
        ];
        for (name, value) in timings {
            if value == 0 {
                return Err(MatchmakingError::ConfigurationError {
                    message: format!("{} must be greater than 0", name),
                });
            }
        }

        for (name, pool) in [("map", &self.map_pool), ("location", &self.location_pool)] {
            if pool.is_empty() {
                return Err(MatchmakingError::ConfigurationError {
                    message: format!("{} pool cannot be empty", name),
                });
            }
            let mut seen = std::collections::HashSet::new();
            if let Some(dup) = pool.iter().find(|item| !seen.insert(item.as_str())) {
                return Err(MatchmakingError::ConfigurationError {
                    message: format!("{} pool lists {} twice", name, dup),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LifecycleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.map_pool.len(), 7);
        assert_eq!(config.confirmation_timeout(), Duration::seconds(20));
    }

    #[test]
    fn test_duplicate_pool_entry_rejected() {
        let mut config = LifecycleConfig::default();
        config.location_pool.push("london".to_string());
        assert!(config.validate().is_err());
    }
}
