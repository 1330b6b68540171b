use shared::{domain::SessionId, error::StoreError};
use thiserror::Error;

/// Errors surfaced by the sync controller and the session directory.
///
/// Superseded binds are not errors; see [`crate::BindOutcome::Superseded`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("failed to load voting data: {source}")]
    LoadFailure {
        /// `None` when listing sessions failed.
        session_id: Option<SessionId>,
        #[source]
        source: StoreError,
    },
    #[error("no authenticated participant")]
    Unauthenticated,
    #[error("vote write rejected: {0}")]
    WriteFailure(#[source] StoreError),
    #[error("voting session is not ready")]
    NotReady,
    #[error("voting session {0} is closed")]
    SessionClosed(SessionId),
}

impl SyncError {
    pub(crate) fn load(session_id: Option<SessionId>, source: StoreError) -> Self {
        Self::LoadFailure { session_id, source }
    }

    /// Short message suitable for a dismissible notification.
    pub fn user_message(&self) -> String {
        match self {
            Self::LoadFailure {
                session_id: Some(_),
                ..
            } => "Could not load the voting session. Try again.".to_string(),
            Self::LoadFailure {
                session_id: None, ..
            } => "Could not load the list of voting sessions. Try again.".to_string(),
            Self::Unauthenticated => "You must be signed in to vote.".to_string(),
            Self::WriteFailure(source) => {
                format!("Your vote could not be recorded: {}", source.message)
            }
            Self::NotReady => "The voting session is still loading.".to_string(),
            Self::SessionClosed(_) => "This voting session is closed.".to_string(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LoadFailure { .. } | Self::WriteFailure(_) | Self::NotReady
        )
    }
}
