//! Live synchronization of one voting session.
//!
//! [`SessionSyncController`] owns a [`SessionView`] for the session it is bound
//! to, loads it from the backend, keeps it current from the backend's change
//! feed, and writes the caller's ballot. Every bind bumps a generation
//! counter; read results and events carried for an older generation are
//! dropped, so a slow load can never overwrite a newer bind.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use shared::{
    domain::{Ballot, ParticipantId, SessionId},
    error::StoreError,
    protocol::{ChangeEvent, NewVote, Vote, VoteChanges, VotingSession},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::{IdentityProvider, Subscription, SubscriptionHandle, VotingBackend},
    config::Settings,
    error::SyncError,
    session_view::{ApplyOutcome, Applied, SessionView, SyncPhase},
    tally::Tally,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Unbound,
    Ready,
    /// A newer bind started before this one finished; its results were dropped.
    Superseded,
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    PhaseChanged {
        session_id: Option<SessionId>,
        phase: SyncPhase,
    },
    SessionUpdated(VotingSession),
    TallyUpdated {
        session_id: SessionId,
        tally: Tally,
    },
    OwnVoteChanged(Option<Vote>),
    VoteRecorded(Vote),
    Error(SyncError),
}

/// Read-only copy of the controller state for presentation.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub phase: SyncPhase,
    pub session_id: Option<SessionId>,
    pub session: Option<VotingSession>,
    pub vote_count: usize,
    pub tally: Tally,
    pub own_vote: Option<Vote>,
    pub last_error: Option<SyncError>,
}

impl SessionSnapshot {
    pub fn is_loading(&self) -> bool {
        self.phase == SyncPhase::Loading
    }

    /// Ballot controls are live only for a ready, open session.
    pub fn accepts_ballots(&self) -> bool {
        self.phase == SyncPhase::Ready
            && self
                .session
                .as_ref()
                .is_some_and(|session| session.status.accepts_ballots())
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub event_buffer: usize,
    pub resync_interval: Option<Duration>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            resync_interval: None,
        }
    }
}

impl From<&Settings> for ControllerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            event_buffer: settings.event_buffer,
            resync_interval: settings.resync_interval(),
        }
    }
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    event_task: JoinHandle<()>,
    resync_task: Option<JoinHandle<()>>,
}

/// Something applied to the view while a resync's reads were in flight.
enum Journaled {
    Change(ChangeEvent),
    Acknowledged(Vote),
}

struct ControllerState {
    generation: u64,
    view: SessionView,
    last_error: Option<SyncError>,
    active: Option<ActiveSubscription>,
    // `Some` while a resync is reading; replayed onto the reloaded view.
    journal: Option<Vec<Journaled>>,
}

struct LoadedSession {
    session: VotingSession,
    votes: Vec<Vote>,
    own_vote: Option<Vote>,
    participant: Option<ParticipantId>,
}

pub struct SessionSyncController {
    backend: Arc<dyn VotingBackend>,
    identity: Arc<dyn IdentityProvider>,
    options: ControllerOptions,
    inner: Mutex<ControllerState>,
    // Serializes "check generation, subscribe, install" so two binds never
    // hold live subscriptions at once.
    subscribe_lock: Mutex<()>,
    cast_lock: Mutex<()>,
    resync_lock: Mutex<()>,
    events: broadcast::Sender<ControllerEvent>,
}

impl SessionSyncController {
    pub fn new(
        backend: Arc<dyn VotingBackend>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Arc<Self> {
        Self::with_options(backend, identity, ControllerOptions::default())
    }

    pub fn with_options(
        backend: Arc<dyn VotingBackend>,
        identity: Arc<dyn IdentityProvider>,
        options: ControllerOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_buffer.max(1));
        Arc::new(Self {
            backend,
            identity,
            options,
            inner: Mutex::new(ControllerState {
                generation: 0,
                view: SessionView::unbound(),
                last_error: None,
                active: None,
                journal: None,
            }),
            subscribe_lock: Mutex::new(()),
            cast_lock: Mutex::new(()),
            resync_lock: Mutex::new(()),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let guard = self.inner.lock().await;
        SessionSnapshot {
            phase: guard.view.phase(),
            session_id: guard.view.session_id(),
            session: guard.view.session().cloned(),
            vote_count: guard.view.votes().len(),
            tally: guard.view.tally(),
            own_vote: guard.view.own_vote().cloned(),
            last_error: guard.last_error.clone(),
        }
    }

    pub async fn bound_session(&self) -> Option<SessionId> {
        self.inner.lock().await.view.session_id()
    }

    pub async fn dismiss_error(&self) {
        self.inner.lock().await.last_error = None;
    }

    /// Binds to `session_id`, or unbinds for `None`.
    ///
    /// The previous subscription is released before anything is loaded. On a
    /// read failure the controller stays bound to the id with an empty view
    /// ([`SyncPhase::Failed`]); binding again retries.
    pub async fn bind(
        self: &Arc<Self>,
        session_id: Option<SessionId>,
    ) -> Result<BindOutcome, SyncError> {
        let generation = {
            let _subscribing = self.subscribe_lock.lock().await;
            let (generation, previous) = {
                let mut guard = self.inner.lock().await;
                guard.generation += 1;
                guard.last_error = None;
                guard.journal = None;
                guard.view = match session_id {
                    Some(id) => SessionView::loading(id),
                    None => SessionView::unbound(),
                };
                (guard.generation, guard.active.take())
            };
            self.release(previous).await;
            generation
        };

        let Some(session_id) = session_id else {
            debug!(generation, "sync: unbound");
            self.emit_phase(None, SyncPhase::Unbound);
            return Ok(BindOutcome::Unbound);
        };
        debug!(%session_id, generation, "sync: loading session");
        self.emit_phase(Some(session_id), SyncPhase::Loading);

        let loaded = self.load(session_id).await;
        self.finish_bind(session_id, generation, loaded).await
    }

    /// Releases the subscription and discards all state. Idempotent.
    pub async fn unbind(self: &Arc<Self>) {
        let _ = self.bind(None).await;
    }

    /// Re-reads the bound session in place, keeping the live subscription.
    ///
    /// Repairs a view that missed change notifications. Changes applied while
    /// the reads are in flight are replayed onto the reloaded view. A failed
    /// resync keeps the current view and reports the error.
    pub async fn resync(self: &Arc<Self>) -> Result<BindOutcome, SyncError> {
        let _resyncing = self.resync_lock.lock().await;
        let (generation, session_id) = {
            let mut guard = self.inner.lock().await;
            let (generation, session_id) = match (guard.view.phase(), guard.view.session_id()) {
                (SyncPhase::Ready, Some(id)) => (guard.generation, id),
                (SyncPhase::Unbound, _) | (_, None) => return Ok(BindOutcome::Unbound),
                _ => return Err(SyncError::NotReady),
            };
            guard.journal = Some(Vec::new());
            (generation, session_id)
        };

        let loaded = self.load(session_id).await;

        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            debug!(%session_id, generation, "sync: dropping stale resync result");
            return Ok(BindOutcome::Superseded);
        }
        let journal = guard.journal.take().unwrap_or_default();
        match loaded {
            Ok(loaded) => {
                let mut fresh = SessionView::ready(
                    loaded.session,
                    loaded.votes,
                    loaded.own_vote,
                    loaded.participant,
                );
                fresh.inherit_tombstones(&guard.view);
                let replayed = journal.len();
                for entry in journal {
                    match entry {
                        Journaled::Change(event) => {
                            fresh.apply(&event);
                        }
                        Journaled::Acknowledged(vote) => {
                            fresh.record_acknowledged(vote);
                        }
                    }
                }
                let previous = std::mem::replace(&mut guard.view, fresh);
                debug!(%session_id, generation, replayed, "sync: resynced");
                self.announce_reload(&previous, &guard.view, session_id);
                Ok(BindOutcome::Ready)
            }
            Err(source) => {
                let err = SyncError::load(Some(session_id), source);
                warn!(%session_id, error = %err, "sync: resync failed");
                self.record_error(&mut guard, err.clone());
                Err(err)
            }
        }
    }

    /// Records the caller's ballot for the bound session.
    ///
    /// Updates the caller's existing vote when there is one, otherwise inserts.
    /// Nothing local changes until the backend acknowledges the write.
    pub async fn cast_vote(
        &self,
        ballot: Ballot,
        justification: Option<String>,
    ) -> Result<Vote, SyncError> {
        let _cast = self.cast_lock.lock().await;

        let Some(participant_id) = self.identity.current_participant().await else {
            return Err(self.fail(SyncError::Unauthenticated).await);
        };

        let (generation, ready, bound, accepts, own_vote) = {
            let guard = self.inner.lock().await;
            (
                guard.generation,
                guard.view.is_ready(),
                guard.view.session_id(),
                guard
                    .view
                    .session()
                    .map(|session| session.status.accepts_ballots()),
                guard
                    .view
                    .own_vote()
                    .filter(|vote| vote.participant_id == participant_id)
                    .cloned(),
            )
        };
        let session_id = match (ready, bound, accepts) {
            (true, Some(session_id), Some(true)) => session_id,
            (true, Some(session_id), Some(false)) => {
                return Err(self.fail(SyncError::SessionClosed(session_id)).await);
            }
            _ => return Err(self.fail(SyncError::NotReady).await),
        };

        let written = match own_vote {
            Some(existing) => self.update_ballot(&existing, ballot, justification).await,
            None => {
                let inserted = self
                    .backend
                    .insert_vote(NewVote {
                        session_id,
                        participant_id,
                        ballot,
                        justification: justification.clone(),
                    })
                    .await;
                match inserted {
                    Err(err) if err.is_conflict() => {
                        self.recover_conflict(session_id, participant_id, ballot, justification, err)
                            .await
                    }
                    other => other,
                }
            }
        };

        let vote = match written {
            Ok(vote) => vote,
            Err(source) => {
                warn!(%session_id, %participant_id, error = %source, "sync: vote write rejected");
                return Err(self.fail(SyncError::WriteFailure(source)).await);
            }
        };

        info!(
            %session_id,
            %participant_id,
            vote_id = %vote.id,
            ballot = %vote.ballot,
            "sync: vote recorded"
        );

        let mut guard = self.inner.lock().await;
        if guard.generation == generation {
            if let Some(journal) = guard.journal.as_mut() {
                journal.push(Journaled::Acknowledged(vote.clone()));
            }
            let before = guard.view.tally();
            if let ApplyOutcome::Applied(applied) = guard.view.record_acknowledged(vote.clone()) {
                self.announce(&guard.view, session_id, before, applied);
            }
        }
        let _ = self.events.send(ControllerEvent::VoteRecorded(vote.clone()));
        Ok(vote)
    }

    async fn update_ballot(
        &self,
        existing: &Vote,
        ballot: Ballot,
        justification: Option<String>,
    ) -> Result<Vote, StoreError> {
        self.backend
            .update_vote(
                existing.id,
                VoteChanges {
                    ballot: Some(ballot),
                    justification,
                },
            )
            .await
    }

    /// The insert lost a race with another write for the same participant
    /// (usually another device). Fold this ballot into that record instead.
    async fn recover_conflict(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
        ballot: Ballot,
        justification: Option<String>,
        conflict: StoreError,
    ) -> Result<Vote, StoreError> {
        debug!(%session_id, %participant_id, "sync: insert conflicted, updating existing vote");
        match self.backend.get_own_vote(session_id, participant_id).await? {
            Some(existing) => self.update_ballot(&existing, ballot, justification).await,
            None => Err(conflict),
        }
    }

    async fn load(&self, session_id: SessionId) -> Result<LoadedSession, StoreError> {
        let participant = self.identity.current_participant().await;

        let own_vote_read = async {
            match participant {
                Some(participant_id) => self.backend.get_own_vote(session_id, participant_id).await,
                None => Ok(None),
            }
        };
        let (session, votes, own_vote) = tokio::join!(
            self.backend.get_session(session_id),
            self.backend.list_votes(session_id),
            own_vote_read,
        );

        let session = session?
            .ok_or_else(|| StoreError::not_found(format!("voting session {session_id} does not exist")))?;
        Ok(LoadedSession {
            session,
            votes: votes?,
            own_vote: own_vote?,
            participant,
        })
    }

    async fn finish_bind(
        self: &Arc<Self>,
        session_id: SessionId,
        generation: u64,
        loaded: Result<LoadedSession, StoreError>,
    ) -> Result<BindOutcome, SyncError> {
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(source) => return self.fail_bind(session_id, generation, source).await,
        };

        let _subscribing = self.subscribe_lock.lock().await;
        if !self.is_current(generation).await {
            debug!(%session_id, generation, "sync: dropping stale load result");
            return Ok(BindOutcome::Superseded);
        }

        let subscription = match self.backend.subscribe_session_events(session_id).await {
            Ok(subscription) => subscription,
            Err(source) => return self.fail_bind(session_id, generation, source).await,
        };

        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            drop(guard);
            debug!(%session_id, generation, "sync: bind superseded while subscribing");
            self.backend.unsubscribe(subscription.handle).await;
            return Ok(BindOutcome::Superseded);
        }

        guard.view = SessionView::ready(
            loaded.session,
            loaded.votes,
            loaded.own_vote,
            loaded.participant,
        );
        guard.active = Some(self.activate(subscription, generation));

        info!(
            %session_id,
            generation,
            votes = guard.view.votes().len(),
            "sync: session ready"
        );
        self.emit_phase(Some(session_id), SyncPhase::Ready);
        if let Some(session) = guard.view.session() {
            let _ = self.events.send(ControllerEvent::SessionUpdated(session.clone()));
        }
        self.emit_tally(session_id, guard.view.tally());
        let _ = self
            .events
            .send(ControllerEvent::OwnVoteChanged(guard.view.own_vote().cloned()));
        Ok(BindOutcome::Ready)
    }

    async fn fail_bind(
        &self,
        session_id: SessionId,
        generation: u64,
        source: StoreError,
    ) -> Result<BindOutcome, SyncError> {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            debug!(%session_id, generation, "sync: dropping stale load failure");
            return Ok(BindOutcome::Superseded);
        }
        let err = SyncError::load(Some(session_id), source);
        warn!(%session_id, generation, error = %err, "sync: load failed");
        guard.view = SessionView::failed(session_id);
        self.emit_phase(Some(session_id), SyncPhase::Failed);
        self.record_error(&mut guard, err.clone());
        Err(err)
    }

    fn activate(self: &Arc<Self>, subscription: Subscription, generation: u64) -> ActiveSubscription {
        let Subscription { handle, events } = subscription;
        let event_task = tokio::spawn(forward_events(Arc::downgrade(self), generation, events));
        let resync_task = self.options.resync_interval.map(|interval| {
            tokio::spawn(periodic_resync(Arc::downgrade(self), generation, interval))
        });
        ActiveSubscription {
            handle,
            event_task,
            resync_task,
        }
    }

    async fn release(&self, active: Option<ActiveSubscription>) {
        let Some(active) = active else {
            return;
        };
        active.event_task.abort();
        if let Some(task) = active.resync_task {
            task.abort();
        }
        self.backend.unsubscribe(active.handle).await;
        debug!(handle = active.handle.0, "sync: subscription released");
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().await.generation == generation
    }

    async fn apply_change(&self, generation: u64, event: ChangeEvent) {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            debug!(generation, "sync: dropping event for superseded bind");
            return;
        }
        let Some(session_id) = guard.view.session_id() else {
            return;
        };
        if let Some(journal) = guard.journal.as_mut() {
            journal.push(Journaled::Change(event.clone()));
        }
        let before = guard.view.tally();
        match guard.view.apply(&event) {
            ApplyOutcome::Applied(applied) => {
                self.announce(&guard.view, session_id, before, applied);
            }
            ApplyOutcome::Ignored(reason) => {
                debug!(%session_id, ?reason, kind = ?event.kind, "sync: change ignored");
            }
        }
    }

    fn announce(&self, view: &SessionView, session_id: SessionId, before: Tally, applied: Applied) {
        if applied.session_changed {
            if let Some(session) = view.session() {
                let _ = self.events.send(ControllerEvent::SessionUpdated(session.clone()));
            }
        }
        if applied.votes_changed && view.tally() != before {
            self.emit_tally(session_id, view.tally());
        }
        if applied.own_vote_changed {
            let _ = self
                .events
                .send(ControllerEvent::OwnVoteChanged(view.own_vote().cloned()));
        }
    }

    fn announce_reload(&self, previous: &SessionView, current: &SessionView, session_id: SessionId) {
        if previous.session() != current.session() {
            if let Some(session) = current.session() {
                let _ = self.events.send(ControllerEvent::SessionUpdated(session.clone()));
            }
        }
        if previous.tally() != current.tally() {
            self.emit_tally(session_id, current.tally());
        }
        if previous.own_vote() != current.own_vote() {
            let _ = self
                .events
                .send(ControllerEvent::OwnVoteChanged(current.own_vote().cloned()));
        }
    }

    fn emit_phase(&self, session_id: Option<SessionId>, phase: SyncPhase) {
        let _ = self
            .events
            .send(ControllerEvent::PhaseChanged { session_id, phase });
    }

    fn emit_tally(&self, session_id: SessionId, tally: Tally) {
        let _ = self
            .events
            .send(ControllerEvent::TallyUpdated { session_id, tally });
    }

    fn record_error(&self, state: &mut ControllerState, err: SyncError) {
        state.last_error = Some(err.clone());
        let _ = self.events.send(ControllerEvent::Error(err));
    }

    async fn fail(&self, err: SyncError) -> SyncError {
        let mut guard = self.inner.lock().await;
        self.record_error(&mut guard, err.clone());
        err
    }
}

async fn forward_events(
    controller: Weak<SessionSyncController>,
    generation: u64,
    mut events: mpsc::Receiver<ChangeEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.apply_change(generation, event).await;
    }
    debug!(generation, "sync: change feed closed");
}

async fn periodic_resync(controller: Weak<SessionSyncController>, generation: u64, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; the bind just loaded everything.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(controller) = controller.upgrade() else {
            break;
        };
        if !controller.is_current(generation).await {
            break;
        }
        if let Err(err) = controller.resync().await {
            debug!(generation, error = %err, "sync: periodic resync failed");
        }
    }
}

impl Drop for SessionSyncController {
    fn drop(&mut self) {
        let Some(active) = self.inner.get_mut().active.take() else {
            return;
        };
        active.event_task.abort();
        if let Some(task) = active.resync_task {
            task.abort();
        }
        let handle = active.handle;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let backend = self.backend.clone();
                runtime.spawn(async move {
                    backend.unsubscribe(handle).await;
                    debug!(handle = handle.0, "sync: subscription released after drop");
                });
            }
            Err(_) => warn!(
                handle = handle.0,
                "sync: controller dropped outside a runtime; backend handle not released"
            ),
        }
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
