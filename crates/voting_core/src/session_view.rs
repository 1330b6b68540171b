//! In-memory view of one bound voting session and the reducer that applies
//! change events to it.
//!
//! The view is a plain state machine: [`SyncPhase::Unbound`] ->
//! [`SyncPhase::Loading`] -> [`SyncPhase::Ready`], with [`SyncPhase::Failed`]
//! for a bind whose reads did not succeed. Every mutation of the vote
//! collection recomputes the tally before returning.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use shared::{
    domain::{ParticipantId, SessionId, VoteId},
    protocol::{ChangeEvent, ChangeKind, ChangeRecord, Vote, VotingSession},
};
use tracing::{debug, warn};

use crate::tally::{compute_tally, Tally};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Unbound,
    Loading,
    Ready,
    /// Bound to a session whose reads failed. Empty, retryable with a new bind.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotReady,
    ForeignSession,
    DuplicateInsert,
    UnknownVote,
    /// An acknowledgment older than the record the feed already applied.
    StaleAcknowledgment,
    /// An acknowledgment for a vote the feed has since deleted.
    DeletedVote,
}

/// What an applied event changed, so the controller knows what to announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub votes_changed: bool,
    pub own_vote_changed: bool,
    pub session_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(Applied),
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Default)]
pub struct SessionView {
    phase: SyncPhase,
    session_id: Option<SessionId>,
    participant: Option<ParticipantId>,
    session: Option<VotingSession>,
    votes: Vec<Vote>,
    own_vote: Option<Vote>,
    tally: Tally,
    // Ids removed by Delete events. Deleted rows never come back, so a late
    // acknowledgment for one of them must not resurrect it.
    tombstones: HashSet<VoteId>,
}

impl SessionView {
    pub fn unbound() -> Self {
        Self::default()
    }

    pub fn loading(session_id: SessionId) -> Self {
        Self {
            phase: SyncPhase::Loading,
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    pub fn failed(session_id: SessionId) -> Self {
        Self {
            phase: SyncPhase::Failed,
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    /// Builds a ready view from the three bind-time reads.
    ///
    /// Records sharing an id are collapsed, the later one winning. When no
    /// own vote was read but the collection holds one for `participant`, that
    /// record fills the slot.
    pub fn ready(
        session: VotingSession,
        votes: Vec<Vote>,
        own_vote: Option<Vote>,
        participant: Option<ParticipantId>,
    ) -> Self {
        let mut unique: Vec<Vote> = Vec::with_capacity(votes.len());
        for vote in votes {
            match unique.iter_mut().find(|existing| existing.id == vote.id) {
                Some(existing) => *existing = vote,
                None => unique.push(vote),
            }
        }

        let own_vote = own_vote.or_else(|| {
            participant.and_then(|p| unique.iter().find(|v| v.participant_id == p).cloned())
        });

        let tally = compute_tally(&unique);
        Self {
            phase: SyncPhase::Ready,
            session_id: Some(session.id),
            participant,
            session: Some(session),
            votes: unique,
            own_vote,
            tally,
            tombstones: HashSet::new(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn participant(&self) -> Option<ParticipantId> {
        self.participant
    }

    pub fn session(&self) -> Option<&VotingSession> {
        self.session.as_ref()
    }

    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    pub fn own_vote(&self) -> Option<&Vote> {
        self.own_vote.as_ref()
    }

    pub fn tally(&self) -> Tally {
        self.tally
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == SyncPhase::Ready
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        if !self.is_ready() {
            return ApplyOutcome::Ignored(IgnoreReason::NotReady);
        }
        if Some(event.session_id()) != self.session_id {
            debug!(
                bound = ?self.session_id,
                event_session = %event.session_id(),
                "sync: ignoring change for a session that is not bound"
            );
            return ApplyOutcome::Ignored(IgnoreReason::ForeignSession);
        }

        match &event.record {
            ChangeRecord::Vote(vote) => self.apply_vote_event(event.kind, vote.clone()),
            ChangeRecord::Session(session) => self.apply_session_event(event.kind, session.clone()),
        }
    }

    pub fn apply_vote_event(&mut self, kind: ChangeKind, vote: Vote) -> ApplyOutcome {
        let outcome = match kind {
            ChangeKind::Insert => {
                if self.votes.iter().any(|existing| existing.id == vote.id) {
                    debug!(vote_id = %vote.id, "sync: duplicate insert ignored");
                    return ApplyOutcome::Ignored(IgnoreReason::DuplicateInsert);
                }
                let own_vote_changed = self.refresh_own_vote(&vote);
                self.votes.push(vote);
                Applied {
                    votes_changed: true,
                    own_vote_changed,
                    session_changed: false,
                }
            }
            ChangeKind::Update => self.upsert_vote(vote),
            ChangeKind::Delete => {
                let Some(index) = self.votes.iter().position(|existing| existing.id == vote.id)
                else {
                    return ApplyOutcome::Ignored(IgnoreReason::UnknownVote);
                };
                let removed = self.votes.remove(index);
                self.tombstones.insert(removed.id);
                let own_vote_changed = self
                    .own_vote
                    .as_ref()
                    .is_some_and(|own| own.id == removed.id);
                if own_vote_changed {
                    self.own_vote = None;
                }
                Applied {
                    votes_changed: true,
                    own_vote_changed,
                    session_changed: false,
                }
            }
        };

        self.tally = compute_tally(&self.votes);
        ApplyOutcome::Applied(outcome)
    }

    pub fn apply_session_event(&mut self, kind: ChangeKind, session: VotingSession) -> ApplyOutcome {
        match kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let changed = self.session.as_ref() != Some(&session);
                self.session = Some(session);
                ApplyOutcome::Applied(Applied {
                    session_changed: changed,
                    ..Applied::default()
                })
            }
            ChangeKind::Delete => {
                warn!(session_id = %session.id, "sync: bound session was deleted");
                self.session = None;
                ApplyOutcome::Applied(Applied {
                    session_changed: true,
                    ..Applied::default()
                })
            }
        }
    }

    /// Applies a record acknowledged by a write. Same replacement rules as an
    /// update event, so the later event for the same write is a no-op.
    ///
    /// The feed may have moved past the write by the time the acknowledgment
    /// is applied: a record the view holds with the same or a later
    /// `updated_at` wins, and a deleted vote stays deleted.
    pub fn record_acknowledged(&mut self, vote: Vote) -> ApplyOutcome {
        if !self.is_ready() {
            return ApplyOutcome::Ignored(IgnoreReason::NotReady);
        }
        if Some(vote.session_id) != self.session_id {
            return ApplyOutcome::Ignored(IgnoreReason::ForeignSession);
        }
        if self.tombstones.contains(&vote.id) {
            debug!(vote_id = %vote.id, "sync: acknowledgment for a deleted vote dropped");
            return ApplyOutcome::Ignored(IgnoreReason::DeletedVote);
        }
        if self
            .votes
            .iter()
            .any(|existing| existing.id == vote.id && existing.updated_at >= vote.updated_at)
        {
            return ApplyOutcome::Ignored(IgnoreReason::StaleAcknowledgment);
        }
        let outcome = self.upsert_vote(vote);
        self.tally = compute_tally(&self.votes);
        ApplyOutcome::Applied(outcome)
    }

    /// Carries the deleted ids of `previous` into this view. Used when a
    /// resync replaces the view of the same session.
    pub fn inherit_tombstones(&mut self, previous: &SessionView) {
        if self.session_id == previous.session_id {
            self.tombstones.extend(previous.tombstones.iter().copied());
        }
    }

    fn upsert_vote(&mut self, vote: Vote) -> Applied {
        let own_vote_changed = self.refresh_own_vote(&vote);
        let votes_changed = match self.votes.iter_mut().find(|existing| existing.id == vote.id) {
            Some(existing) if *existing == vote => false,
            Some(existing) => {
                *existing = vote;
                true
            }
            // An update for a record we never saw still describes a live row.
            None => {
                self.votes.push(vote);
                true
            }
        };
        Applied {
            votes_changed,
            own_vote_changed,
            session_changed: false,
        }
    }

    fn refresh_own_vote(&mut self, vote: &Vote) -> bool {
        if self.participant != Some(vote.participant_id) {
            return false;
        }
        if self.own_vote.as_ref() == Some(vote) {
            return false;
        }
        self.own_vote = Some(vote.clone());
        true
    }
}

#[cfg(test)]
#[path = "tests/session_view_tests.rs"]
mod tests;
