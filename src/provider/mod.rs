//! External game-server provider integration

pub mod client;
pub mod types;

pub use client::{GameServerProvider, HttpGameServerProvider, MockGameServerProvider};
pub use types::{ProviderMatch, ProviderPlayer, ServerAssignment, ServerSpec};
