//! Contracts for the collaborators the sync engine consumes: the vote record
//! store / session registry and the source of the caller's identity.

use async_trait::async_trait;
use shared::{
    domain::{ParticipantId, SessionId, VoteId},
    error::StoreError,
    protocol::{ChangeEvent, NewVote, SessionSummary, Vote, VoteChanges, VotingSession},
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

/// A live change-event feed for one session. Events stop arriving once the
/// handle is passed to [`VotingBackend::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::Receiver<ChangeEvent>,
}

#[async_trait]
pub trait VotingBackend: Send + Sync {
    async fn get_session(&self, session_id: SessionId)
        -> Result<Option<VotingSession>, StoreError>;
    /// Sessions ordered most recent first.
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError>;
    async fn list_votes(&self, session_id: SessionId) -> Result<Vec<Vote>, StoreError>;
    async fn get_own_vote(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> Result<Option<Vote>, StoreError>;
    /// Must fail with a `Conflict` error when the participant already voted.
    async fn insert_vote(&self, vote: NewVote) -> Result<Vote, StoreError>;
    async fn update_vote(&self, vote_id: VoteId, changes: VoteChanges)
        -> Result<Vote, StoreError>;
    /// Feed of vote and session changes whose session id is `session_id`.
    async fn subscribe_session_events(
        &self,
        session_id: SessionId,
    ) -> Result<Subscription, StoreError>;
    async fn unsubscribe(&self, handle: SubscriptionHandle);
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_participant(&self) -> Option<ParticipantId>;
}

pub struct AnonymousIdentity;

#[async_trait]
impl IdentityProvider for AnonymousIdentity {
    async fn current_participant(&self) -> Option<ParticipantId> {
        None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StaticIdentity(pub ParticipantId);

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_participant(&self) -> Option<ParticipantId> {
        Some(self.0)
    }
}

#[async_trait]
impl IdentityProvider for Option<ParticipantId> {
    async fn current_participant(&self) -> Option<ParticipantId> {
        *self
    }
}

pub struct MissingVotingBackend;

fn unavailable() -> StoreError {
    StoreError::unavailable("voting backend is unavailable")
}

#[async_trait]
impl VotingBackend for MissingVotingBackend {
    async fn get_session(
        &self,
        _session_id: SessionId,
    ) -> Result<Option<VotingSession>, StoreError> {
        Err(unavailable())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        Err(unavailable())
    }

    async fn list_votes(&self, _session_id: SessionId) -> Result<Vec<Vote>, StoreError> {
        Err(unavailable())
    }

    async fn get_own_vote(
        &self,
        _session_id: SessionId,
        _participant_id: ParticipantId,
    ) -> Result<Option<Vote>, StoreError> {
        Err(unavailable())
    }

    async fn insert_vote(&self, _vote: NewVote) -> Result<Vote, StoreError> {
        Err(unavailable())
    }

    async fn update_vote(
        &self,
        _vote_id: VoteId,
        _changes: VoteChanges,
    ) -> Result<Vote, StoreError> {
        Err(unavailable())
    }

    async fn subscribe_session_events(
        &self,
        _session_id: SessionId,
    ) -> Result<Subscription, StoreError> {
        Err(unavailable())
    }

    async fn unsubscribe(&self, _handle: SubscriptionHandle) {}
}
