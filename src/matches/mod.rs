//! Match aggregate, storage and lifecycle operations

pub mod matchmaker;
pub mod provisioning;
pub mod service;
pub mod state;
pub mod store;
pub mod veto;

pub use matchmaker::{FifoPairingPolicy, MatchmakingCoordinator, Pairing, PairingPolicy};
pub use provisioning::{
    ProvisioningCoordinator, ProvisioningDecision, ProvisioningLock, ProvisioningResponse,
};
pub use service::{CancellationHandler, MatchService};
pub use state::{
    BanOutcome, CancelReason, ConfirmOutcome, LiveFeed, Match, MatchPhase, MatchResult,
    MatchSetup, MatchStateKind, ProvisioningStatus,
};
pub use store::{InMemoryMatchStore, MatchStore};
pub use veto::{VetoPool, VetoState};
