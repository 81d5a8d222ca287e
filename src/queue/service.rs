//! Queue operations: join, leave and status
//!
//! A join is validated for every member of the joining unit before anything
//! is written, so a party either enters the queue whole or not at all.

use crate::amqp::publisher::EventPublisher;
use crate::error::{MatchmakingError, Result};
use crate::matches::store::MatchStore;
use crate::metrics::MetricsCollector;
use crate::queue::party::PartyDirectory;
use crate::queue::store::{EnqueueOutcome, QueueEntry, QueueStore, QueueUnit};
use crate::trust::{check_queue_eligibility, DenialReason, Eligibility};
use crate::types::{GameMode, QueueEvent, UserId};
use crate::users::UserStore;
use crate::utils::current_timestamp;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct QueueService {
    queue: Arc<dyn QueueStore>,
    users: Arc<dyn UserStore>,
    parties: Arc<dyn PartyDirectory>,
    matches: Arc<dyn MatchStore>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<MetricsCollector>,
}

impl QueueService {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        users: Arc<dyn UserStore>,
        parties: Arc<dyn PartyDirectory>,
        matches: Arc<dyn MatchStore>,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            queue,
            users,
            parties,
            matches,
            publisher,
            metrics,
        }
    }

    /// Queue the user, or the user's whole party when they lead one.
    ///
    /// Joining again with the same unit returns the existing entries and
    /// publishes nothing.
    pub async fn join(&self, user_id: &str, mode: GameMode) -> Result<Vec<QueueEntry>> {
        let started = Instant::now();
        let (members, party_id) = match self.parties.party_of(user_id)? {
            Some(party) => {
                if party.leader_id != user_id {
                    return Err(MatchmakingError::NotPartyLeader {
                        leader_id: party.leader_id,
                    });
                }
                if party.size() == 0 || party.size() > mode.team_size() {
                    return Err(MatchmakingError::PartySizeMismatch {
                        party_size: party.size(),
                        team_size: mode.team_size(),
                    });
                }
                (party.members, Some(party.id))
            }
            None => (vec![user_id.to_string()], None),
        };

        for member in &members {
            self.validate_member(member)?;
        }

        let unit = QueueUnit::new(mode, members, party_id, current_timestamp());
        let outcome = self.queue.enqueue(unit)?;
        let entries = match outcome {
            EnqueueOutcome::AlreadyQueued(entries) => {
                debug!("{} is already queued for {}", user_id, mode);
                return Ok(entries);
            }
            EnqueueOutcome::Enqueued(entries) => entries,
        };

        info!(
            "{} player(s) joined the {} queue (leader: {})",
            entries.len(),
            mode,
            user_id
        );
        self.metrics.record_queue_join(mode, entries.len());
        self.metrics
            .update_queue_depth(mode, self.queue.count_by_mode(mode)?);
        self.metrics.record_operation("queue_join", started.elapsed());

        let event = QueueEvent::Joined {
            user_ids: entries.iter().map(|e| e.user_id.clone()).collect(),
            mode,
            joined_at: entries
                .first()
                .map(|e| e.joined_at)
                .unwrap_or_else(current_timestamp),
        };
        if let Err(e) = self.publisher.publish_queue_event(event).await {
            warn!("Failed to publish queue join for {}: {}", user_id, e);
        }

        Ok(entries)
    }

    /// Remove the user's unit from every queue. Not being queued is not an
    /// error.
    pub async fn leave(&self, user_id: &str) -> Result<Vec<QueueEntry>> {
        let removed = self.queue.remove_user(user_id)?;
        if removed.is_empty() {
            debug!("{} left the queue but was not queued", user_id);
            return Ok(removed);
        }

        let mut by_mode: BTreeMap<GameMode, Vec<UserId>> = BTreeMap::new();
        for entry in &removed {
            by_mode
                .entry(entry.mode)
                .or_default()
                .push(entry.user_id.clone());
        }

        let now = current_timestamp();
        for (mode, user_ids) in by_mode {
            info!("{} player(s) left the {} queue", user_ids.len(), mode);
            self.metrics.record_queue_leave(mode, user_ids.len());
            self.metrics
                .update_queue_depth(mode, self.queue.count_by_mode(mode)?);
            let event = QueueEvent::Left {
                user_ids,
                mode,
                timestamp: now,
            };
            if let Err(e) = self.publisher.publish_queue_event(event).await {
                warn!("Failed to publish queue leave for {}: {}", user_id, e);
            }
        }
        Ok(removed)
    }

    /// Entries the user currently holds
    pub fn status(&self, user_id: &str) -> Result<Vec<QueueEntry>> {
        self.queue.entries_for_user(user_id)
    }

    pub fn count_by_mode(&self, mode: GameMode) -> Result<usize> {
        self.queue.count_by_mode(mode)
    }

    fn validate_member(&self, user_id: &str) -> Result<()> {
        let user = self
            .users
            .get(user_id)?
            .ok_or_else(|| MatchmakingError::UserNotFound {
                user_id: user_id.to_string(),
            })?;
        if user.is_banned {
            return Err(MatchmakingError::Banned {
                user_id: user_id.to_string(),
            });
        }
        if user.steam_id.is_none() {
            return Err(MatchmakingError::MissingLinkedIdentity {
                user_id: user_id.to_string(),
            });
        }
        match check_queue_eligibility(&user) {
            Eligibility::Allowed => {}
            Eligibility::Denied(DenialReason::Banned) => {
                return Err(MatchmakingError::Banned {
                    user_id: user_id.to_string(),
                })
            }
            Eligibility::Denied(reason) => {
                return Err(MatchmakingError::NotEligible {
                    reason: format!("{}: {}", user_id, reason),
                })
            }
        }
        if self.matches.active_match_for(user_id)?.is_some() {
            return Err(MatchmakingError::AlreadyInActiveMatch {
                user_id: user_id.to_string(),
            });
        }
        Ok(())
    }
}
