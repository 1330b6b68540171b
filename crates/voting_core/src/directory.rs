use std::sync::Arc;

use shared::{domain::SessionId, protocol::SessionSummary};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    backend::VotingBackend,
    controller::{BindOutcome, SessionSyncController},
    error::SyncError,
};

/// Picks the session to show when nothing is selected: the first open one in
/// list order, otherwise the most recently created.
pub fn select_default(sessions: &[SessionSummary]) -> Option<SessionId> {
    sessions
        .iter()
        .find(|session| session.status.accepts_ballots())
        .or_else(|| sessions.iter().max_by_key(|session| session.created_at))
        .map(|session| session.id)
}

/// Lists voting sessions and switches the controller between them.
pub struct SessionDirectory {
    backend: Arc<dyn VotingBackend>,
    controller: Arc<SessionSyncController>,
    sessions: Mutex<Vec<SessionSummary>>,
}

impl SessionDirectory {
    pub fn new(backend: Arc<dyn VotingBackend>, controller: Arc<SessionSyncController>) -> Self {
        Self {
            backend,
            controller,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn controller(&self) -> &Arc<SessionSyncController> {
        &self.controller
    }

    /// Most recent first. The last successful listing is kept for [`Self::cached`].
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, SyncError> {
        let mut sessions = self.backend.list_sessions().await.map_err(|source| {
            warn!(error = %source, "directory: listing sessions failed");
            SyncError::load(None, source)
        })?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(count = sessions.len(), "directory: sessions listed");
        *self.sessions.lock().await = sessions.clone();
        Ok(sessions)
    }

    pub async fn cached(&self) -> Vec<SessionSummary> {
        self.sessions.lock().await.clone()
    }

    pub async fn select(&self, session_id: SessionId) -> Result<BindOutcome, SyncError> {
        info!(%session_id, "directory: session selected");
        self.controller.bind(Some(session_id)).await
    }

    pub async fn clear_selection(&self) {
        self.controller.unbind().await;
    }

    /// Lists sessions and keeps the current selection while it is still listed;
    /// otherwise binds the default, or unbinds when there is none.
    pub async fn refresh(&self) -> Result<Option<SessionId>, SyncError> {
        let sessions = self.list_sessions().await?;
        let current = self.controller.bound_session().await;
        if let Some(current) = current {
            if sessions.iter().any(|session| session.id == current) {
                return Ok(Some(current));
            }
        }

        match select_default(&sessions) {
            Some(session_id) => {
                self.select(session_id).await?;
                Ok(Some(session_id))
            }
            None => {
                if current.is_some() {
                    self.clear_selection().await;
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
