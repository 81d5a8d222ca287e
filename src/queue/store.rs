//! Queue entry storage
//!
//! Entries are grouped into units. A solo player is a unit of one; a party is
//! one unit holding every member, all sharing the same `joined_at`. Units are
//! added and removed whole.

use crate::error::{MatchmakingError, Result};
use crate::types::{GameMode, PartyId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use uuid::Uuid;

/// One queued player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub user_id: UserId,
    pub mode: GameMode,
    pub joined_at: DateTime<Utc>,
    pub party_id: Option<PartyId>,
    pub unit_id: Uuid,
}

/// Players that queued together and must be matched together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueUnit {
    pub id: Uuid,
    pub mode: GameMode,
    pub members: Vec<UserId>,
    pub party_id: Option<PartyId>,
    pub joined_at: DateTime<Utc>,
}

impl QueueUnit {
    pub fn new(
        mode: GameMode,
        members: Vec<UserId>,
        party_id: Option<PartyId>,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            members,
            party_id,
            joined_at,
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.members
            .iter()
            .map(|user_id| QueueEntry {
                user_id: user_id.clone(),
                mode: self.mode,
                joined_at: self.joined_at,
                party_id: self.party_id,
                unit_id: self.id,
            })
            .collect()
    }
}

/// Result of an enqueue attempt
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued(Vec<QueueEntry>),
    /// The same unit was already waiting; nothing changed
    AlreadyQueued(Vec<QueueEntry>),
}

impl EnqueueOutcome {
    pub fn entries(&self) -> &[QueueEntry] {
        match self {
            EnqueueOutcome::Enqueued(entries) | EnqueueOutcome::AlreadyQueued(entries) => entries,
        }
    }
}

/// Trait for queue storage operations. Every method is one atomic step.
pub trait QueueStore: Send + Sync {
    /// Add a unit. Idempotent when the identical member set is already queued
    /// in the mode; fails with `AlreadyQueued` when any member is queued in
    /// that mode as part of a different unit.
    fn enqueue(&self, unit: QueueUnit) -> Result<EnqueueOutcome>;

    /// Remove every unit containing the user, in every mode
    fn remove_user(&self, user_id: &str) -> Result<Vec<QueueEntry>>;

    /// Waiting units of a mode, oldest first
    fn units(&self, mode: GameMode) -> Result<Vec<QueueUnit>>;

    /// Remove exactly these units, plus any other entries their members hold
    /// in other modes. Fails without removing anything if a unit is gone.
    fn take_units(&self, mode: GameMode, unit_ids: &[Uuid]) -> Result<Vec<QueueUnit>>;

    fn entries_for_user(&self, user_id: &str) -> Result<Vec<QueueEntry>>;

    fn count_by_mode(&self, mode: GameMode) -> Result<usize>;
}

/// In-memory queue storage implementation
#[derive(Debug, Default)]
pub struct InMemoryQueueStore {
    units: RwLock<HashMap<GameMode, Vec<QueueUnit>>>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for InMemoryQueueStore {
    fn enqueue(&self, unit: QueueUnit) -> Result<EnqueueOutcome> {
        let mut units = self
            .units
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("queue write"))?;
        let waiting = units.entry(unit.mode).or_default();

        let requested: HashSet<&UserId> = unit.members.iter().collect();
        for existing in waiting.iter() {
            let held: HashSet<&UserId> = existing.members.iter().collect();
            if held == requested {
                return Ok(EnqueueOutcome::AlreadyQueued(existing.entries()));
            }
            if let Some(clash) = existing.members.iter().find(|m| requested.contains(m)) {
                return Err(MatchmakingError::AlreadyQueued {
                    user_id: clash.clone(),
                });
            }
        }

        let entries = unit.entries();
        waiting.push(unit);
        Ok(EnqueueOutcome::Enqueued(entries))
    }

    fn remove_user(&self, user_id: &str) -> Result<Vec<QueueEntry>> {
        let mut units = self
            .units
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("queue write"))?;

        let mut removed = Vec::new();
        for waiting in units.values_mut() {
            waiting.retain(|unit| {
                if unit.members.iter().any(|m| m == user_id) {
                    removed.extend(unit.entries());
                    false
                } else {
                    true
                }
            });
        }
        Ok(removed)
    }

    fn units(&self, mode: GameMode) -> Result<Vec<QueueUnit>> {
        let units = self
            .units
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("queue read"))?;
        let mut waiting = units.get(&mode).cloned().unwrap_or_default();
        waiting.sort_by_key(|u| u.joined_at);
        Ok(waiting)
    }

    fn take_units(&self, mode: GameMode, unit_ids: &[Uuid]) -> Result<Vec<QueueUnit>> {
        let mut units = self
            .units
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("queue write"))?;

        let wanted: HashSet<&Uuid> = unit_ids.iter().collect();
        let waiting = units.get(&mode).map(Vec::as_slice).unwrap_or_default();
        let taken: Vec<QueueUnit> = waiting
            .iter()
            .filter(|u| wanted.contains(&u.id))
            .cloned()
            .collect();
        if taken.len() != wanted.len() {
            return Err(MatchmakingError::InvalidPairing {
                reason: "a selected queue unit is no longer waiting".to_string(),
            });
        }

        let players: HashSet<&UserId> = taken.iter().flat_map(|u| u.members.iter()).collect();
        for waiting in units.values_mut() {
            waiting.retain(|u| !wanted.contains(&u.id) && !u.members.iter().any(|m| players.contains(m)));
        }
        Ok(taken)
    }

    fn entries_for_user(&self, user_id: &str) -> Result<Vec<QueueEntry>> {
        let units = self
            .units
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("queue read"))?;
        Ok(units
            .values()
            .flatten()
            .filter(|u| u.members.iter().any(|m| m == user_id))
            .flat_map(|u| u.entries())
            .filter(|e| e.user_id == user_id)
            .collect())
    }

    fn count_by_mode(&self, mode: GameMode) -> Result<usize> {
        let units = self
            .units
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("queue read"))?;
        Ok(units
            .get(&mode)
            .map(|waiting| waiting.iter().map(QueueUnit::size).sum())
            .unwrap_or(0))
    }
}
