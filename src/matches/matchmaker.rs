//! Pairing queued units into new matches
//!
//! The pairing heuristic sits behind [`PairingPolicy`]. Whatever a policy
//! proposes, [`MatchmakingCoordinator`] checks the contract before any
//! state changes: teams are disjoint, both have exactly the mode's team size,
//! every player is still queued and nobody is already in an active match.

use crate::amqp::publisher::{publish_best_effort, EventPublisher};
use crate::config::LifecycleConfig;
use crate::error::{MatchmakingError, Result};
use crate::matches::state::{Match, MatchPhase};
use crate::matches::store::MatchStore;
use crate::metrics::MetricsCollector;
use crate::queue::store::{QueueStore, QueueUnit};
use crate::types::{GameMode, MatchEvent, UserId};
use crate::utils::current_timestamp;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Units assigned to each side
#[derive(Debug, Clone, PartialEq)]
pub struct Pairing {
    pub team_a: Vec<QueueUnit>,
    pub team_b: Vec<QueueUnit>,
}

impl Pairing {
    pub fn team_a_ids(&self) -> Vec<UserId> {
        self.team_a.iter().flat_map(|u| u.members.clone()).collect()
    }

    pub fn team_b_ids(&self) -> Vec<UserId> {
        self.team_b.iter().flat_map(|u| u.members.clone()).collect()
    }

    pub fn unit_ids(&self) -> Vec<Uuid> {
        self.team_a
            .iter()
            .chain(self.team_b.iter())
            .map(|u| u.id)
            .collect()
    }
}

/// Proposes a pairing from the waiting units of one mode
pub trait PairingPolicy: Send + Sync {
    /// `None` when nothing can be paired yet
    fn propose(&self, mode: GameMode, waiting: &[QueueUnit]) -> Option<Pairing>;
}

/// Oldest units first, first-fit into team A and then team B
#[derive(Debug, Default, Clone)]
pub struct FifoPairingPolicy;

impl FifoPairingPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl PairingPolicy for FifoPairingPolicy {
    fn propose(&self, mode: GameMode, waiting: &[QueueUnit]) -> Option<Pairing> {
        let team_size = mode.team_size();
        let mut ordered: Vec<&QueueUnit> = waiting.iter().collect();
        ordered.sort_by_key(|u| u.joined_at);

        let mut team_a: Vec<QueueUnit> = Vec::new();
        let mut team_b: Vec<QueueUnit> = Vec::new();
        let (mut size_a, mut size_b) = (0, 0);

        for unit in ordered {
            if unit.size() == 0 || unit.size() > team_size {
                continue;
            }
            if size_a + unit.size() <= team_size {
                size_a += unit.size();
                team_a.push(unit.clone());
            } else if size_b + unit.size() <= team_size {
                size_b += unit.size();
                team_b.push(unit.clone());
            }
            if size_a == team_size && size_b == team_size {
                return Some(Pairing { team_a, team_b });
            }
        }
        None
    }
}

pub struct MatchmakingCoordinator {
    queue: Arc<dyn QueueStore>,
    matches: Arc<dyn MatchStore>,
    policy: Arc<dyn PairingPolicy>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
    lifecycle: LifecycleConfig,
}

impl MatchmakingCoordinator {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        matches: Arc<dyn MatchStore>,
        policy: Arc<dyn PairingPolicy>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
        lifecycle: LifecycleConfig,
    ) -> Self {
        Self {
            queue,
            matches,
            policy,
            publisher,
            metrics,
            lifecycle,
        }
    }

    /// Try to create one match for `mode`. `Ok(None)` means nothing paired
    /// and nothing changed.
    pub async fn run_once(&self, mode: GameMode) -> Result<Option<Match>> {
        let waiting = self.queue.units(mode)?;
        let pairing = match self.policy.propose(mode, &waiting) {
            Some(pairing) => pairing,
            None => {
                debug!("No pairing for {} ({} units waiting)", mode, waiting.len());
                return Ok(None);
            }
        };
        self.validate(mode, &pairing, &waiting)?;

        let taken = self.queue.take_units(mode, &pairing.unit_ids())?;
        let now = current_timestamp();
        let created = Match::new(
            mode,
            pairing.team_a_ids(),
            pairing.team_b_ids(),
            self.lifecycle.map_pool.clone(),
            self.lifecycle.location_pool.clone(),
            now,
            now + self.lifecycle.confirmation_timeout(),
        );

        if let Err(e) = self.matches.insert(created.clone()) {
            warn!("Match insert failed for {}: {}, requeueing players", mode, e);
            for unit in taken {
                if let Err(requeue_err) = self.queue.enqueue(unit) {
                    error!("Failed to requeue unit: {}", requeue_err);
                }
            }
            return Err(e);
        }

        let waits: Vec<std::time::Duration> = taken
            .iter()
            .flat_map(|unit| {
                let wait = (now - unit.joined_at).to_std().unwrap_or_default();
                std::iter::repeat(wait).take(unit.size())
            })
            .collect();
        self.metrics.record_match_created(mode, &waits);
        self.metrics
            .update_queue_depth(mode, self.queue.count_by_mode(mode)?);

        info!(
            "Created {} match {}: [{}] vs [{}]",
            mode,
            created.id,
            created.team_a.join(", "),
            created.team_b.join(", ")
        );
        let deadline = match &created.phase {
            MatchPhase::Confirming { deadline, .. } => *deadline,
            _ => now,
        };
        publish_best_effort(
            self.publisher.as_ref(),
            MatchEvent::Created {
                match_id: created.id,
                mode,
                team_a: created.team_a.clone(),
                team_b: created.team_b.clone(),
                confirmation_deadline: deadline,
            },
        )
        .await;

        Ok(Some(created))
    }

    fn validate(&self, mode: GameMode, pairing: &Pairing, waiting: &[QueueUnit]) -> Result<()> {
        let invalid = |reason: String| MatchmakingError::InvalidPairing { reason };
        let team_a = pairing.team_a_ids();
        let team_b = pairing.team_b_ids();

        if team_a.len() != mode.team_size() || team_b.len() != mode.team_size() {
            return Err(invalid(format!(
                "{} needs {} per team, got {} and {}",
                mode,
                mode.team_size(),
                team_a.len(),
                team_b.len()
            )));
        }

        let mut seen = HashSet::new();
        for user in team_a.iter().chain(team_b.iter()) {
            if !seen.insert(user.as_str()) {
                return Err(invalid(format!("{} appears twice", user)));
            }
        }

        let queued: HashSet<Uuid> = waiting.iter().map(|u| u.id).collect();
        if let Some(unit) = pairing
            .team_a
            .iter()
            .chain(pairing.team_b.iter())
            .find(|u| !queued.contains(&u.id) || u.mode != mode)
        {
            return Err(invalid(format!("unit {} is not queued for {}", unit.id, mode)));
        }

        for user in &seen {
            if self.matches.active_match_for(user)?.is_some() {
                return Err(MatchmakingError::AlreadyInActiveMatch {
                    user_id: user.to_string(),
                });
            }
        }
        Ok(())
    }
}
