//! Live ingestion from the game-server provider

pub mod normalize;
pub mod poller;
pub mod scheduler;

pub use normalize::{normalize, side_for_label, NormalizedFeed, NormalizedPlayer};
pub use poller::{IngestionJob, TickOutcome};
pub use scheduler::IngestionScheduler;
