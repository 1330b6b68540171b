use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Ballot, ParticipantId, SessionId, SessionStatus, VoteId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingSession {
    pub id: SessionId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_item: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl VotingSession {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            title: self.title.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub ballot: Ballot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVote {
    pub session_id: SessionId,
    pub participant_id: ParticipantId,
    pub ballot: Ballot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

/// Partial update of a vote. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ballot: Option<Ballot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    Vote,
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "record", rename_all = "snake_case")]
pub enum ChangeRecord {
    Vote(Vote),
    Session(VotingSession),
}

/// Row-level change notification. Delete events carry the row as it was before removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(flatten)]
    pub record: ChangeRecord,
}

impl ChangeEvent {
    pub fn vote(kind: ChangeKind, vote: Vote) -> Self {
        Self {
            kind,
            record: ChangeRecord::Vote(vote),
        }
    }

    pub fn session(kind: ChangeKind, session: VotingSession) -> Self {
        Self {
            kind,
            record: ChangeRecord::Session(session),
        }
    }

    pub fn table(&self) -> ChangeTable {
        match self.record {
            ChangeRecord::Vote(_) => ChangeTable::Vote,
            ChangeRecord::Session(_) => ChangeTable::Session,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match &self.record {
            ChangeRecord::Vote(vote) => vote.session_id,
            ChangeRecord::Session(session) => session.id,
        }
    }
}
