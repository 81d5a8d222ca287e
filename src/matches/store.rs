//! Match storage
//!
//! All state transitions go through [`MatchStore::update`], which runs the
//! closure against a copy under the store's write lock and only commits when
//! it succeeds. This is the compare-and-swap every concurrent actor relies on.

use crate::error::{MatchmakingError, Result};
use crate::matches::state::{Match, MatchStateKind};
use crate::types::MatchId;
use std::collections::HashMap;
use std::sync::RwLock;

/// Trait for match storage operations
pub trait MatchStore: Send + Sync {
    /// Insert a new match. Fails with `AlreadyInActiveMatch` if any
    /// participant is already in a non-terminal match.
    fn insert(&self, m: Match) -> Result<()>;

    fn get(&self, match_id: MatchId) -> Result<Option<Match>>;

    /// Atomically read-modify-write a match
    fn update(
        &self,
        match_id: MatchId,
        apply: &mut dyn FnMut(&mut Match) -> Result<()>,
    ) -> Result<Match>;

    /// The non-terminal match the user takes part in, if any
    fn active_match_for(&self, user_id: &str) -> Result<Option<Match>>;

    fn list_by_state(&self, state: MatchStateKind) -> Result<Vec<Match>>;

    fn count_by_state(&self) -> Result<HashMap<MatchStateKind, usize>>;
}

/// Run `apply` as one atomic transition and hand back both the committed
/// match and whatever the closure produced.
pub fn transition<T>(
    store: &dyn MatchStore,
    match_id: MatchId,
    mut apply: impl FnMut(&mut Match) -> Result<T>,
) -> Result<(Match, T)> {
    let mut produced = None;
    let committed = store.update(match_id, &mut |m| {
        produced = Some(apply(m)?);
        Ok(())
    })?;
    let value = produced.ok_or_else(|| MatchmakingError::InternalError {
        message: format!("transition on {} produced no value", match_id),
    })?;
    Ok((committed, value))
}

/// Fetch a match or fail with `MatchNotFound`
pub fn require_match(store: &dyn MatchStore, match_id: MatchId) -> Result<Match> {
    store
        .get(match_id)?
        .ok_or(MatchmakingError::MatchNotFound { match_id })
}

/// In-memory match storage implementation
#[derive(Debug, Default)]
pub struct InMemoryMatchStore {
    matches: RwLock<HashMap<MatchId, Match>>,
}

impl InMemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MatchStore for InMemoryMatchStore {
    fn insert(&self, m: Match) -> Result<()> {
        let mut matches = self
            .matches
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("matches write"))?;

        for existing in matches.values().filter(|e| !e.is_terminal()) {
            if let Some(user) = m.participants().find(|u| existing.side_of(u).is_some()) {
                return Err(MatchmakingError::AlreadyInActiveMatch {
                    user_id: user.clone(),
                });
            }
        }
        matches.insert(m.id, m);
        Ok(())
    }

    fn get(&self, match_id: MatchId) -> Result<Option<Match>> {
        let matches = self
            .matches
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("matches read"))?;
        Ok(matches.get(&match_id).cloned())
    }

    fn update(
        &self,
        match_id: MatchId,
        apply: &mut dyn FnMut(&mut Match) -> Result<()>,
    ) -> Result<Match> {
        let mut matches = self
            .matches
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("matches write"))?;
        let current = matches
            .get(&match_id)
            .ok_or(MatchmakingError::MatchNotFound { match_id })?;

        let mut next = current.clone();
        apply(&mut next)?;
        matches.insert(match_id, next.clone());
        Ok(next)
    }

    fn active_match_for(&self, user_id: &str) -> Result<Option<Match>> {
        let matches = self
            .matches
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("matches read"))?;
        Ok(matches
            .values()
            .find(|m| !m.is_terminal() && m.side_of(user_id).is_some())
            .cloned())
    }

    fn list_by_state(&self, state: MatchStateKind) -> Result<Vec<Match>> {
        let matches = self
            .matches
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("matches read"))?;
        let mut found: Vec<Match> = matches
            .values()
            .filter(|m| m.state() == state)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.created_at);
        Ok(found)
    }

    fn count_by_state(&self) -> Result<HashMap<MatchStateKind, usize>> {
        let matches = self
            .matches
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("matches read"))?;
        let mut counts = HashMap::new();
        for m in matches.values() {
            *counts.entry(m.state()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
