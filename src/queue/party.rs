//! Party membership lookup
//!
//! Parties are owned by the social collaborator; the queue only needs to know
//! who leads a party and who is in it.

use crate::error::{MatchmakingError, Result};
use crate::types::{PartyId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub id: PartyId,
    pub leader_id: UserId,
    /// Every member, leader included
    pub members: Vec<UserId>,
}

impl Party {
    pub fn new(leader_id: impl Into<UserId>, others: &[&str]) -> Self {
        let leader_id = leader_id.into();
        let mut members = vec![leader_id.clone()];
        members.extend(others.iter().map(|m| m.to_string()));
        Self {
            id: Uuid::new_v4(),
            leader_id,
            members,
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}

pub trait PartyDirectory: Send + Sync {
    /// The party the user currently belongs to, if any
    fn party_of(&self, user_id: &str) -> Result<Option<Party>>;
}

#[derive(Debug, Default)]
pub struct InMemoryPartyDirectory {
    parties: RwLock<HashMap<PartyId, Party>>,
}

impl InMemoryPartyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, party: Party) -> Result<()> {
        self.parties
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("parties write"))?
            .insert(party.id, party);
        Ok(())
    }

    pub fn disband(&self, party_id: PartyId) -> Result<Option<Party>> {
        Ok(self
            .parties
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("parties write"))?
            .remove(&party_id))
    }
}

impl PartyDirectory for InMemoryPartyDirectory {
    fn party_of(&self, user_id: &str) -> Result<Option<Party>> {
        let parties = self
            .parties
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("parties read"))?;
        Ok(parties
            .values()
            .find(|p| p.members.iter().any(|m| m == user_id))
            .cloned())
    }
}
