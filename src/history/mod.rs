//! Match history persistence and read models

pub mod queries;
pub mod store;

pub use queries::{AggregateStats, EloPoint, HistoryQueries, MapWinRate, UserMatchSummary};
pub use store::{
    InMemoryHistoryStore, MatchHistory, MatchHistoryStore, PlayerStat, PlayerStatStore,
};
