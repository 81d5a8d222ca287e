//! Operator authorization
//!
//! Admin operations are gated on a capability set resolved from the
//! authenticated user id. The policy is injected, so deployments can back it
//! with whatever role store the identity collaborator exposes.

use crate::config::AuthorizationSettings;
use crate::error::{MatchmakingError, Result};
use crate::types::UserId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Operator capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Owner,
    Manager,
    Admin,
    Support,
}

/// Privileged operation exposed to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    ForceFinishMatch,
    CancelMatch,
    CancelWager,
    ForceWagerWinner,
    MarkWagerDisputed,
    ViewRevenue,
}

impl AdminAction {
    /// Capabilities of which at least one is required. Owner passes every check.
    pub fn required_capabilities(&self) -> &'static [Capability] {
        match self {
            AdminAction::ForceFinishMatch | AdminAction::ForceWagerWinner => {
                &[Capability::Owner, Capability::Admin]
            }
            AdminAction::CancelMatch | AdminAction::CancelWager => {
                &[Capability::Owner, Capability::Admin, Capability::Manager]
            }
            AdminAction::MarkWagerDisputed => &[
                Capability::Owner,
                Capability::Admin,
                Capability::Manager,
                Capability::Support,
            ],
            AdminAction::ViewRevenue => &[Capability::Owner, Capability::Manager],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdminAction::ForceFinishMatch => "force_finish_match",
            AdminAction::CancelMatch => "cancel_match",
            AdminAction::CancelWager => "cancel_wager",
            AdminAction::ForceWagerWinner => "force_wager_winner",
            AdminAction::MarkWagerDisputed => "mark_wager_disputed",
            AdminAction::ViewRevenue => "view_revenue",
        }
    }
}

/// Trait for resolving and checking operator capabilities
#[async_trait]
pub trait AuthorizationPolicy: Send + Sync {
    /// Capabilities held by an authenticated user
    async fn capabilities(&self, user_id: &str) -> Result<HashSet<Capability>>;

    /// Fail with `Unauthorized` unless the user may perform `action`
    async fn authorize(&self, user_id: &str, action: AdminAction) -> Result<()> {
        let held = self.capabilities(user_id).await?;
        let allowed = held.contains(&Capability::Owner)
            || action
                .required_capabilities()
                .iter()
                .any(|cap| held.contains(cap));

        if allowed {
            debug!("{} authorized for {}", user_id, action.as_str());
            Ok(())
        } else {
            warn!("{} denied {}", user_id, action.as_str());
            Err(MatchmakingError::Unauthorized {
                action: action.as_str().to_string(),
            })
        }
    }
}

/// Role table loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizationPolicy {
    roles: HashMap<UserId, HashSet<Capability>>,
}

impl StaticAuthorizationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &AuthorizationSettings) -> Self {
        Self {
            roles: settings
                .roles
                .iter()
                .map(|(user, caps)| (user.clone(), caps.iter().copied().collect()))
                .collect(),
        }
    }

    pub fn grant(mut self, user_id: impl Into<UserId>, capability: Capability) -> Self {
        self.roles.entry(user_id.into()).or_default().insert(capability);
        self
    }
}

#[async_trait]
impl AuthorizationPolicy for StaticAuthorizationPolicy {
    async fn capabilities(&self, user_id: &str) -> Result<HashSet<Capability>> {
        Ok(self.roles.get(user_id).cloned().unwrap_or_default())
    }
}
