//! Alternating-ban veto over a map pool and a location pool
//!
//! Team A bans when an even number of items are already banned, team B when
//! odd. The last item standing is selected automatically.

use crate::error::{MatchmakingError, Result};
use crate::types::{TeamSide, VetoKind};
use serde::{Deserialize, Serialize};

/// One elimination round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VetoPool {
    pool: Vec<String>,
    banned: Vec<String>,
    selected: Option<String>,
}

impl VetoPool {
    pub fn new(pool: Vec<String>) -> Self {
        let selected = if pool.len() == 1 {
            pool.first().cloned()
        } else {
            None
        };
        Self {
            pool,
            banned: Vec::new(),
            selected,
        }
    }

    pub fn pool(&self) -> &[String] {
        &self.pool
    }

    pub fn banned(&self) -> &[String] {
        &self.banned
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn remaining(&self) -> Vec<&str> {
        self.pool
            .iter()
            .filter(|item| !self.banned.contains(item))
            .map(String::as_str)
            .collect()
    }

    /// Side whose turn it is to ban
    pub fn turn(&self) -> TeamSide {
        if self.banned.len() % 2 == 0 {
            TeamSide::A
        } else {
            TeamSide::B
        }
    }

    /// Ban `item` on behalf of `side`. Returns the selection once the pool
    /// is down to one item.
    pub fn ban(&mut self, item: &str, side: TeamSide) -> Result<Option<String>> {
        if !self.pool.iter().any(|i| i == item) {
            return Err(MatchmakingError::ItemNotInPool {
                item: item.to_string(),
            });
        }
        if self.banned.iter().any(|i| i == item) {
            return Err(MatchmakingError::AlreadyBanned {
                item: item.to_string(),
            });
        }
        if let Some(selected) = &self.selected {
            return Err(MatchmakingError::PoolResolved {
                selected: selected.clone(),
            });
        }
        if self.turn() != side {
            return Err(MatchmakingError::NotYourTurn);
        }

        self.banned.push(item.to_string());
        let last = match self.remaining().as_slice() {
            [only] => Some(only.to_string()),
            _ => None,
        };
        if last.is_some() {
            self.selected = last;
        }
        Ok(self.selected.clone())
    }
}

/// Both veto rounds of a match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VetoState {
    pub maps: VetoPool,
    pub locations: VetoPool,
}

impl VetoState {
    pub fn new(map_pool: Vec<String>, location_pool: Vec<String>) -> Self {
        Self {
            maps: VetoPool::new(map_pool),
            locations: VetoPool::new(location_pool),
        }
    }

    pub fn pool_mut(&mut self, kind: VetoKind) -> &mut VetoPool {
        match kind {
            VetoKind::Map => &mut self.maps,
            VetoKind::Location => &mut self.locations,
        }
    }

    /// Final `(map, location)` once both pools are decided
    pub fn resolved(&self) -> Option<(String, String)> {
        match (self.maps.selected(), self.locations.selected()) {
            (Some(map), Some(location)) => Some((map.to_string(), location.to_string())),
            _ => None,
        }
    }
}
