//! Health checks for readiness and liveness probes

use crate::service::engine::{Engine, EngineSnapshot};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value: 0 unhealthy, 1 degraded, 2 healthy
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Unhealthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Healthy => 2,
        }
    }

    fn worst(self, other: HealthStatus) -> HealthStatus {
        if self.as_gauge() <= other.as_gauge() {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: EngineSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl ComponentCheck {
    fn timed(name: &str, probe: impl FnOnce() -> (HealthStatus, Option<String>)) -> Self {
        let start = Instant::now();
        let (status, message) = probe();
        Self {
            name: name.to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

impl HealthCheck {
    /// Full check of every component
    pub fn check(engine: &Engine, running: bool) -> Result<Self> {
        let checks = vec![
            ComponentCheck::timed("service_running", || {
                if running {
                    (HealthStatus::Healthy, None)
                } else {
                    (
                        HealthStatus::Unhealthy,
                        Some("Service is not running".to_string()),
                    )
                }
            }),
            Self::check_stores(engine),
            Self::check_ledger(engine),
        ];
        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, c| acc.worst(c.status));
        let stats = engine.snapshot().unwrap_or_else(|e| {
            warn!("Could not build engine snapshot: {}", e);
            EngineSnapshot::default()
        });

        Ok(Self {
            status,
            service: engine.config().service.name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    pub fn liveness_check(running: bool) -> HealthStatus {
        if running {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Ready when running and the stores answer
    pub fn readiness_check(engine: &Engine, running: bool) -> HealthStatus {
        if !running {
            return HealthStatus::Unhealthy;
        }
        Self::check_stores(engine).status
    }

    fn check_stores(engine: &Engine) -> ComponentCheck {
        ComponentCheck::timed("stores", || {
            let stores = engine.stores();
            match (
                stores.matches.count_by_state(),
                stores.queue.count_by_mode(crate::types::GameMode::OneVsOne),
            ) {
                (Ok(_), Ok(_)) => (HealthStatus::Healthy, None),
                (Err(e), _) | (_, Err(e)) => (HealthStatus::Unhealthy, Some(e.to_string())),
            }
        })
    }

    /// Disputed wagers need an operator; the service still works
    fn check_ledger(engine: &Engine) -> ComponentCheck {
        ComponentCheck::timed("wager_ledger", || match engine.ledger().revenue_stats() {
            Ok(stats) if stats.disputed_wagers > 0 => (
                HealthStatus::Degraded,
                Some(format!("{} disputed wager(s) awaiting review", stats.disputed_wagers)),
            ),
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
