//! User records and the storage interface for them
//!
//! Only the fields the engine reads or mutates live here: ratings, trust
//! inputs, the cached wager balance and the ban flag. Profiles, sessions and
//! linking flows belong to the identity collaborator.

use crate::error::{MatchmakingError, Result};
use crate::types::{GameMode, UserId};
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Signals supplied by the linked game account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SteamSignals {
    pub hours: u32,
    pub account_age_years: f64,
    pub vac_bans: u32,
    pub game_bans: u32,
}

/// A platform user as seen by the match engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Linked external game identity (SteamID64)
    pub steam_id: Option<String>,
    pub elo_1v1: i32,
    pub elo_5v5: i32,
    pub games_1v1: u32,
    pub games_5v5: u32,
    pub trust_score: u32,
    pub steam: SteamSignals,
    /// Reports against this user upheld by moderators
    pub validated_reports: u32,
    /// Spendable balance; a projection of the wager transaction log
    pub balance: u64,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<UserId>, initial_elo: i32) -> Self {
        Self {
            id: id.into(),
            steam_id: None,
            elo_1v1: initial_elo,
            elo_5v5: initial_elo,
            games_1v1: 0,
            games_5v5: 0,
            trust_score: 1000,
            steam: SteamSignals::default(),
            validated_reports: 0,
            balance: 0,
            is_banned: false,
            created_at: current_timestamp(),
        }
    }

    pub fn with_steam(mut self, steam_id: impl Into<String>, signals: SteamSignals) -> Self {
        self.steam_id = Some(steam_id.into());
        self.steam = signals;
        self
    }

    pub fn with_balance(mut self, balance: u64) -> Self {
        self.balance = balance;
        self
    }

    pub fn elo(&self, mode: GameMode) -> i32 {
        match mode {
            GameMode::OneVsOne => self.elo_1v1,
            GameMode::FiveVsFive => self.elo_5v5,
        }
    }

    pub fn games_played(&self, mode: GameMode) -> u32 {
        match mode {
            GameMode::OneVsOne => self.games_1v1,
            GameMode::FiveVsFive => self.games_5v5,
        }
    }

    /// Store a settled rating and count the rated game
    pub fn apply_rating(&mut self, mode: GameMode, new_elo: i32) {
        match mode {
            GameMode::OneVsOne => {
                self.elo_1v1 = new_elo;
                self.games_1v1 += 1;
            }
            GameMode::FiveVsFive => {
                self.elo_5v5 = new_elo;
                self.games_5v5 += 1;
            }
        }
    }
}

/// Trait for user storage operations
pub trait UserStore: Send + Sync {
    fn get(&self, user_id: &str) -> Result<Option<User>>;

    /// Fetch several users; missing ids are left out of the result
    fn get_many(&self, user_ids: &[UserId]) -> Result<HashMap<UserId, User>>;

    fn insert(&self, user: User) -> Result<()>;

    /// Atomically read-modify-write one user. When `apply` fails nothing is
    /// written.
    fn update(&self, user_id: &str, apply: &mut dyn FnMut(&mut User) -> Result<()>)
        -> Result<User>;

    fn find_by_steam_id(&self, steam_id: &str) -> Result<Option<User>>;
}

/// In-memory user storage implementation
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<UserId, User>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UserStore for InMemoryUserStore {
    fn get(&self, user_id: &str) -> Result<Option<User>> {
        let users = self
            .users
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("users read"))?;
        Ok(users.get(user_id).cloned())
    }

    fn get_many(&self, user_ids: &[UserId]) -> Result<HashMap<UserId, User>> {
        let users = self
            .users
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("users read"))?;
        Ok(user_ids
            .iter()
            .filter_map(|id| users.get(id).map(|u| (id.clone(), u.clone())))
            .collect())
    }

    fn insert(&self, user: User) -> Result<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("users write"))?;
        users.insert(user.id.clone(), user);
        Ok(())
    }

    fn update(
        &self,
        user_id: &str,
        apply: &mut dyn FnMut(&mut User) -> Result<()>,
    ) -> Result<User> {
        let mut users = self
            .users
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("users write"))?;
        let current = users
            .get(user_id)
            .ok_or_else(|| MatchmakingError::UserNotFound {
                user_id: user_id.to_string(),
            })?;

        let mut next = current.clone();
        apply(&mut next)?;
        users.insert(user_id.to_string(), next.clone());
        Ok(next)
    }

    fn find_by_steam_id(&self, steam_id: &str) -> Result<Option<User>> {
        let users = self
            .users
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("users read"))?;
        Ok(users
            .values()
            .find(|u| u.steam_id.as_deref() == Some(steam_id))
            .cloned())
    }
}
