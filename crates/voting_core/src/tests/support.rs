use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{Ballot, ParticipantId, SessionId, SessionStatus, VoteId},
    error::{ErrorCode, StoreError},
    protocol::{
        ChangeEvent, ChangeKind, NewVote, SessionSummary, Vote, VoteChanges, VotingSession,
    },
};
use tokio::sync::{mpsc, Semaphore};

use crate::{
    backend::{Subscription, SubscriptionHandle, VotingBackend},
    controller::{SessionSnapshot, SessionSyncController},
};

pub(crate) fn vote(session_id: SessionId, participant_id: ParticipantId, ballot: Ballot) -> Vote {
    let now = Utc::now();
    Vote {
        id: VoteId::new(),
        session_id,
        participant_id,
        ballot,
        justification: None,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn session(title: &str, status: SessionStatus, created_at: DateTime<Utc>) -> VotingSession {
    VotingSession {
        id: SessionId::new(),
        title: title.to_string(),
        description: None,
        status,
        linked_item: None,
        created_at,
        updated_at: created_at,
        closed_at: None,
    }
}

pub(crate) fn open_session(title: &str) -> VotingSession {
    session(title, SessionStatus::Open, Utc::now())
}

/// Polls the controller until `predicate` holds, panicking after two seconds.
pub(crate) async fn wait_for<F>(controller: &SessionSyncController, mut predicate: F) -> SessionSnapshot
where
    F: FnMut(&SessionSnapshot) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = controller.snapshot().await;
        if predicate(&snapshot) {
            return snapshot;
        }
        assert!(
            Instant::now() < deadline,
            "condition not reached, last snapshot: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A second change the backend commits right after the next `update_vote`,
/// before that write is acknowledged.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RacingWrite {
    Delete,
    Update(Ballot),
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<SessionId, VotingSession>,
    votes: Vec<Vote>,
    subscribers: HashMap<SubscriptionHandle, (SessionId, mpsc::Sender<ChangeEvent>)>,
    max_concurrent: usize,
    subscribe_calls: usize,
    failing_reads: HashSet<SessionId>,
    failing_writes: Option<StoreError>,
    list_fails: bool,
    muted: bool,
    read_gates: HashMap<SessionId, Arc<Semaphore>>,
    racing_write: Option<RacingWrite>,
}

impl MemoryState {
    fn publish(&mut self, event: ChangeEvent) {
        if self.muted {
            return;
        }
        let session_id = event.session_id();
        for (subscribed, tx) in self.subscribers.values() {
            if *subscribed == session_id {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    fn check_read(&self, session_id: SessionId) -> Result<(), StoreError> {
        if self.failing_reads.contains(&session_id) {
            return Err(StoreError::unavailable("reads are failing"));
        }
        Ok(())
    }
}

/// In-memory backend with fault injection, read gates and subscription accounting.
#[derive(Default)]
pub(crate) struct MemoryBackend {
    state: Mutex<MemoryState>,
    next_handle: AtomicU64,
}

impl MemoryBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory backend state poisoned")
    }

    pub(crate) fn put_session(&self, session: VotingSession) -> VotingSession {
        self.state().sessions.insert(session.id, session.clone());
        session
    }

    pub(crate) fn seed_vote(&self, vote: Vote) -> Vote {
        self.state().votes.push(vote.clone());
        vote
    }

    pub(crate) fn stored_votes(&self, session_id: SessionId) -> Vec<Vote> {
        self.state()
            .votes
            .iter()
            .filter(|vote| vote.session_id == session_id)
            .cloned()
            .collect()
    }

    pub(crate) fn close_session(&self, session_id: SessionId) -> VotingSession {
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(&session_id)
            .expect("session to close exists");
        let now = Utc::now();
        session.status = SessionStatus::Closed;
        session.closed_at = Some(now);
        session.updated_at = now;
        let closed = session.clone();
        state.publish(ChangeEvent::session(ChangeKind::Update, closed.clone()));
        closed
    }

    pub(crate) fn delete_vote(&self, vote_id: VoteId) -> Vote {
        let mut state = self.state();
        let index = state
            .votes
            .iter()
            .position(|vote| vote.id == vote_id)
            .expect("vote to delete exists");
        let removed = state.votes.remove(index);
        state.publish(ChangeEvent::vote(ChangeKind::Delete, removed.clone()));
        removed
    }

    /// Delivers `event` to matching subscribers without touching stored rows.
    pub(crate) fn inject(&self, event: ChangeEvent) {
        self.state().publish(event);
    }

    /// While muted, writes land but no change events are delivered.
    pub(crate) fn set_muted(&self, muted: bool) {
        self.state().muted = muted;
    }

    pub(crate) fn fail_reads(&self, session_id: SessionId, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_reads.insert(session_id);
        } else {
            state.failing_reads.remove(&session_id);
        }
    }

    pub(crate) fn fail_writes(&self, error: Option<StoreError>) {
        self.state().failing_writes = error;
    }

    pub(crate) fn fail_listing(&self, failing: bool) {
        self.state().list_fails = failing;
    }

    /// Holds `get_session` for `session_id` until permits are added to the
    /// returned semaphore.
    pub(crate) fn gate_reads(&self, session_id: SessionId) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.state().read_gates.insert(session_id, gate.clone());
        gate
    }

    /// The next `update_vote` is followed by `racing` and its acknowledgment
    /// is held back until the feed has had time to deliver both changes.
    pub(crate) fn race_next_update(&self, racing: RacingWrite) {
        self.state().racing_write = Some(racing);
    }

    pub(crate) fn active_subscriptions(&self) -> usize {
        self.state().subscribers.len()
    }

    pub(crate) fn subscribed_sessions(&self) -> Vec<SessionId> {
        self.state()
            .subscribers
            .values()
            .map(|(session_id, _)| *session_id)
            .collect()
    }

    pub(crate) fn max_concurrent_subscriptions(&self) -> usize {
        self.state().max_concurrent
    }

    pub(crate) fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }
}

#[async_trait]
impl VotingBackend for MemoryBackend {
    async fn get_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<VotingSession>, StoreError> {
        let gate = self.state().read_gates.get(&session_id).cloned();
        if let Some(gate) = gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| StoreError::unavailable("read gate closed"))?;
        }
        let state = self.state();
        state.check_read(session_id)?;
        Ok(state.sessions.get(&session_id).cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let state = self.state();
        if state.list_fails {
            return Err(StoreError::unavailable("listing is failing"));
        }
        let mut sessions: Vec<_> = state.sessions.values().map(VotingSession::summary).collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn list_votes(&self, session_id: SessionId) -> Result<Vec<Vote>, StoreError> {
        let state = self.state();
        state.check_read(session_id)?;
        Ok(state
            .votes
            .iter()
            .filter(|vote| vote.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn get_own_vote(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> Result<Option<Vote>, StoreError> {
        let state = self.state();
        state.check_read(session_id)?;
        Ok(state
            .votes
            .iter()
            .find(|vote| vote.session_id == session_id && vote.participant_id == participant_id)
            .cloned())
    }

    async fn insert_vote(&self, new_vote: NewVote) -> Result<Vote, StoreError> {
        let mut state = self.state();
        if let Some(err) = state.failing_writes.clone() {
            return Err(err);
        }
        match state.sessions.get(&new_vote.session_id) {
            None => return Err(StoreError::not_found("voting session does not exist")),
            Some(session) if !session.status.accepts_ballots() => {
                return Err(StoreError::new(
                    ErrorCode::Validation,
                    "voting session is closed",
                ))
            }
            Some(_) => {}
        }
        if state.votes.iter().any(|vote| {
            vote.session_id == new_vote.session_id && vote.participant_id == new_vote.participant_id
        }) {
            return Err(StoreError::conflict("participant already voted"));
        }

        let mut created = vote(new_vote.session_id, new_vote.participant_id, new_vote.ballot);
        created.justification = new_vote.justification;
        state.votes.push(created.clone());
        state.publish(ChangeEvent::vote(ChangeKind::Insert, created.clone()));
        Ok(created)
    }

    async fn update_vote(
        &self,
        vote_id: VoteId,
        changes: VoteChanges,
    ) -> Result<Vote, StoreError> {
        let (updated, raced) = {
            let mut state = self.state();
            if let Some(err) = state.failing_writes.clone() {
                return Err(err);
            }
            let Some(existing) = state.votes.iter_mut().find(|vote| vote.id == vote_id) else {
                return Err(StoreError::not_found("vote does not exist"));
            };
            if let Some(ballot) = changes.ballot {
                existing.ballot = ballot;
            }
            if changes.justification.is_some() {
                existing.justification = changes.justification;
            }
            existing.updated_at = Utc::now();
            let updated = existing.clone();
            state.publish(ChangeEvent::vote(ChangeKind::Update, updated.clone()));

            let raced = state.racing_write.take();
            match raced {
                Some(RacingWrite::Delete) => {
                    state.votes.retain(|vote| vote.id != vote_id);
                    state.publish(ChangeEvent::vote(ChangeKind::Delete, updated.clone()));
                }
                Some(RacingWrite::Update(ballot)) => {
                    let mut newer = updated.clone();
                    newer.ballot = ballot;
                    newer.updated_at = Utc::now();
                    if let Some(stored) = state.votes.iter_mut().find(|vote| vote.id == vote_id) {
                        *stored = newer.clone();
                    }
                    state.publish(ChangeEvent::vote(ChangeKind::Update, newer));
                }
                None => {}
            }
            (updated, raced.is_some())
        };
        if raced {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(updated)
    }

    async fn subscribe_session_events(
        &self,
        session_id: SessionId,
    ) -> Result<Subscription, StoreError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state();
        state.subscribe_calls += 1;
        state.subscribers.insert(handle, (session_id, tx));
        state.max_concurrent = state.max_concurrent.max(state.subscribers.len());
        Ok(Subscription { handle, events: rx })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.state().subscribers.remove(&handle);
    }
}
