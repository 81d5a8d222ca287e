//! Matchmaking queue: entries, parties and the join/leave service

pub mod party;
pub mod service;
pub mod store;

pub use party::{InMemoryPartyDirectory, Party, PartyDirectory};
pub use service::QueueService;
pub use store::{EnqueueOutcome, InMemoryQueueStore, QueueEntry, QueueStore, QueueUnit};
