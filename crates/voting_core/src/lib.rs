pub mod backend;
pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod session_view;
mod storage_backend;
pub mod tally;

pub use backend::{
    AnonymousIdentity, IdentityProvider, MissingVotingBackend, StaticIdentity, Subscription,
    SubscriptionHandle, VotingBackend,
};
pub use controller::{
    BindOutcome, ControllerEvent, ControllerOptions, SessionSnapshot, SessionSyncController,
};
pub use directory::{select_default, SessionDirectory};
pub use error::SyncError;
pub use session_view::{ApplyOutcome, SessionView, SyncPhase};
pub use storage_backend::{StorageBackend, DEFAULT_SUBSCRIPTION_BUFFER};
pub use tally::{compute_tally, Tally};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
