//! Append-only audit trail for operator actions

use crate::auth::AdminAction;
use crate::error::{MatchmakingError, Result};
use crate::types::UserId;
use crate::utils::{current_timestamp, generate_record_id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor: UserId,
    pub action: AdminAction,
    /// Id of the match or wager acted on
    pub target: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor: impl Into<UserId>,
        action: AdminAction,
        target: impl ToString,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_record_id(),
            actor: actor.into(),
            action,
            target: target.to_string(),
            detail: detail.into(),
            at: current_timestamp(),
        }
    }
}

pub trait AuditLog: Send + Sync {
    fn record(&self, entry: AuditEntry) -> Result<()>;

    /// Entries about one target, oldest first
    fn for_target(&self, target: &str) -> Result<Vec<AuditEntry>>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditLog for InMemoryAuditLog {
    fn record(&self, entry: AuditEntry) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("audit log"))?
            .push(entry);
        Ok(())
    }

    fn for_target(&self, target: &str) -> Result<Vec<AuditEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("audit log"))?;
        Ok(entries
            .iter()
            .filter(|e| e.target == target)
            .cloned()
            .collect())
    }
}
