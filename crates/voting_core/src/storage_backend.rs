use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use shared::{
    domain::{ParticipantId, SessionId, VoteId},
    error::StoreError,
    protocol::{ChangeEvent, NewVote, SessionSummary, Vote, VoteChanges, VotingSession},
};
use storage::Storage;
use tokio::{
    sync::{broadcast::error::RecvError, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::backend::{Subscription, SubscriptionHandle, VotingBackend};

pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 256;

/// [`VotingBackend`] over the SQLite [`Storage`]. Each subscription is a task
/// filtering the storage change feed down to one session.
pub struct StorageBackend {
    store: Storage,
    buffer: usize,
    next_handle: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionHandle, JoinHandle<()>>>,
}

impl StorageBackend {
    pub fn new(store: Storage) -> Self {
        Self::with_buffer(store, DEFAULT_SUBSCRIPTION_BUFFER)
    }

    pub fn with_buffer(store: Storage, buffer: usize) -> Self {
        Self {
            store,
            buffer: buffer.max(1),
            next_handle: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.store
    }

    pub async fn active_subscriptions(&self) -> usize {
        let mut guard = self.subscriptions.lock().await;
        guard.retain(|_, task| !task.is_finished());
        guard.len()
    }
}

fn store_error(err: anyhow::Error) -> StoreError {
    StoreError::from_anyhow(&err)
}

#[async_trait]
impl VotingBackend for StorageBackend {
    async fn get_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<VotingSession>, StoreError> {
        self.store.get_session(session_id).await.map_err(store_error)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.store.list_sessions().await.map_err(store_error)
    }

    async fn list_votes(&self, session_id: SessionId) -> Result<Vec<Vote>, StoreError> {
        self.store.list_votes(session_id).await.map_err(store_error)
    }

    async fn get_own_vote(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> Result<Option<Vote>, StoreError> {
        self.store
            .vote_for_participant(session_id, participant_id)
            .await
            .map_err(store_error)
    }

    async fn insert_vote(&self, vote: NewVote) -> Result<Vote, StoreError> {
        self.store.insert_vote(vote).await.map_err(store_error)
    }

    async fn update_vote(
        &self,
        vote_id: VoteId,
        changes: VoteChanges,
    ) -> Result<Vote, StoreError> {
        self.store
            .update_vote(vote_id, changes)
            .await
            .map_err(store_error)
    }

    async fn subscribe_session_events(
        &self,
        session_id: SessionId,
    ) -> Result<Subscription, StoreError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut feed = self.store.subscribe_changes();
        let (tx, rx) = mpsc::channel::<ChangeEvent>(self.buffer);

        let task = tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) if event.session_id() == session_id => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            %session_id,
                            skipped,
                            handle = handle.0,
                            "storage feed: subscriber lagged, change events were dropped"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        self.subscriptions.lock().await.insert(handle, task);
        debug!(%session_id, handle = handle.0, "storage feed: subscribed");
        Ok(Subscription { handle, events: rx })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(task) = self.subscriptions.lock().await.remove(&handle) {
            task.abort();
            debug!(handle = handle.0, "storage feed: unsubscribed");
        }
    }
}

impl Drop for StorageBackend {
    fn drop(&mut self) {
        for (_, task) in self.subscriptions.get_mut().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/storage_backend_tests.rs"]
mod tests;
