use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::broadcast;
use tracing::{debug, info};

use shared::{
    domain::{Ballot, ParticipantId, SessionId, SessionStatus, VoteId},
    error::{ErrorCode, StoreError},
    protocol::{ChangeEvent, ChangeKind, NewVote, SessionSummary, Vote, VoteChanges, VotingSession},
};

const CHANGE_FEED_CAPACITY: usize = 1024;

const SESSION_COLUMNS: &str =
    "id, title, description, status, linked_item, created_at, updated_at, closed_at";
const VOTE_COLUMNS: &str =
    "id, session_id, participant_id, ballot, justification, created_at, updated_at";

/// SQLite-backed vote record store and session registry.
///
/// Every committed write is published on an in-process change feed, which is
/// what subscribers use in place of database-level row notifications.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<ChangeEvent>,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub title: String,
    pub description: Option<String>,
    pub linked_item: Option<String>,
}

impl NewSession {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            linked_item: None,
        }
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Receiver for every change committed through this handle (and its clones).
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    fn publish(&self, event: ChangeEvent) {
        debug!(
            session_id = %event.session_id(),
            kind = ?event.kind,
            table = ?event.table(),
            "storage: publishing change"
        );
        // No receivers is fine; the feed is best-effort.
        let _ = self.changes.send(event);
    }

    pub async fn create_session(&self, new_session: NewSession) -> Result<VotingSession> {
        let title = new_session.title.trim();
        if title.is_empty() {
            return Err(StoreError::new(ErrorCode::Validation, "session title must not be empty").into());
        }

        let now = Utc::now();
        let session = VotingSession {
            id: SessionId::new(),
            title: title.to_string(),
            description: normalize_text(new_session.description),
            status: SessionStatus::Open,
            linked_item: normalize_text(new_session.linked_item),
            created_at: now,
            updated_at: now,
            closed_at: None,
        };

        sqlx::query(
            "INSERT INTO voting_sessions (id, title, description, status, linked_item, created_at, updated_at, closed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(session.id.to_string())
        .bind(&session.title)
        .bind(session.description.as_deref())
        .bind(session.status.as_str())
        .bind(session.linked_item.as_deref())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .context("failed to insert voting session")?;

        info!(session_id = %session.id, title = %session.title, "storage: session created");
        self.publish(ChangeEvent::session(ChangeKind::Insert, session.clone()));
        Ok(session)
    }

    /// Closes an open session. Closing is one-way; an already closed session is
    /// returned unchanged and no change is published.
    pub async fn close_session(&self, session_id: SessionId) -> Result<Option<VotingSession>> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE voting_sessions SET status = 'closed', closed_at = ?, updated_at = ?
             WHERE id = ? AND status = 'open'
             RETURNING {SESSION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to close voting session")?;

        match row {
            Some(row) => {
                let session = session_from_row(&row)?;
                info!(session_id = %session.id, "storage: session closed");
                self.publish(ChangeEvent::session(ChangeKind::Update, session.clone()));
                Ok(Some(session))
            }
            None => self.get_session(session_id).await,
        }
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<Option<VotingSession>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM voting_sessions WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Sessions ordered most recent first.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query(
            "SELECT id, title, status, created_at
             FROM voting_sessions
             ORDER BY created_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(SessionSummary {
                    id: parse_column(r, "id")?,
                    title: r.try_get("title")?,
                    status: parse_column(r, "status")?,
                    created_at: r.try_get::<DateTime<Utc>, _>("created_at")?,
                })
            })
            .collect()
    }

    pub async fn list_votes(&self, session_id: SessionId) -> Result<Vec<Vote>> {
        let sql = format!(
            "SELECT {VOTE_COLUMNS} FROM votes WHERE session_id = ? ORDER BY created_at ASC, rowid ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(vote_from_row).collect()
    }

    pub async fn vote_for_participant(
        &self,
        session_id: SessionId,
        participant_id: ParticipantId,
    ) -> Result<Option<Vote>> {
        let sql =
            format!("SELECT {VOTE_COLUMNS} FROM votes WHERE session_id = ? AND participant_id = ?");
        let row = sqlx::query(&sql)
            .bind(session_id.to_string())
            .bind(participant_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(vote_from_row).transpose()
    }

    /// Inserts the first vote of a participant in an open session.
    ///
    /// A second vote for the same `(session, participant)` fails with a
    /// `Conflict` [`StoreError`].
    pub async fn insert_vote(&self, new_vote: NewVote) -> Result<Vote> {
        let now = Utc::now();
        let vote = Vote {
            id: VoteId::new(),
            session_id: new_vote.session_id,
            participant_id: new_vote.participant_id,
            ballot: new_vote.ballot,
            justification: normalize_text(new_vote.justification),
            created_at: now,
            updated_at: now,
        };

        let result = sqlx::query(
            "INSERT INTO votes (id, session_id, participant_id, ballot, justification, created_at, updated_at)
             SELECT ?, ?, ?, ?, ?, ?, ?
             WHERE EXISTS (SELECT 1 FROM voting_sessions WHERE id = ? AND status = 'open')",
        )
        .bind(vote.id.to_string())
        .bind(vote.session_id.to_string())
        .bind(vote.participant_id.to_string())
        .bind(vote.ballot.as_str())
        .bind(vote.justification.as_deref())
        .bind(vote.created_at)
        .bind(vote.updated_at)
        .bind(vote.session_id.to_string())
        .execute(&self.pool)
        .await;

        let inserted = match result {
            Ok(done) => done.rows_affected(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(StoreError::conflict(format!(
                    "participant {} already voted in session {}",
                    vote.participant_id, vote.session_id
                ))
                .into());
            }
            Err(err) => return Err(anyhow::Error::new(err).context("failed to insert vote")),
        };

        if inserted == 0 {
            return Err(self.closed_or_missing(vote.session_id).await?.into());
        }

        info!(
            session_id = %vote.session_id,
            participant_id = %vote.participant_id,
            vote_id = %vote.id,
            ballot = %vote.ballot,
            "storage: vote inserted"
        );
        self.publish(ChangeEvent::vote(ChangeKind::Insert, vote.clone()));
        Ok(vote)
    }

    pub async fn update_vote(&self, vote_id: VoteId, changes: VoteChanges) -> Result<Vote> {
        let sql = format!(
            "UPDATE votes
             SET ballot = COALESCE(?, ballot),
                 justification = COALESCE(?, justification),
                 updated_at = ?
             WHERE id = ?
               AND session_id IN (SELECT id FROM voting_sessions WHERE status = 'open')
             RETURNING {VOTE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(changes.ballot.map(Ballot::as_str))
            .bind(normalize_text(changes.justification))
            .bind(Utc::now())
            .bind(vote_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to update vote")?;

        let Some(row) = row else {
            let existing = self.get_vote(vote_id).await?;
            return Err(match existing {
                Some(vote) => self.closed_or_missing(vote.session_id).await?,
                None => StoreError::not_found(format!("vote {vote_id} does not exist")),
            }
            .into());
        };

        let vote = vote_from_row(&row)?;
        info!(
            session_id = %vote.session_id,
            vote_id = %vote.id,
            ballot = %vote.ballot,
            "storage: vote updated"
        );
        self.publish(ChangeEvent::vote(ChangeKind::Update, vote.clone()));
        Ok(vote)
    }

    /// Removes a vote, returning the row as it was.
    pub async fn delete_vote(&self, vote_id: VoteId) -> Result<Option<Vote>> {
        let sql = format!("DELETE FROM votes WHERE id = ? RETURNING {VOTE_COLUMNS}");
        let row = sqlx::query(&sql)
            .bind(vote_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to delete vote")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let vote = vote_from_row(&row)?;
        info!(session_id = %vote.session_id, vote_id = %vote.id, "storage: vote deleted");
        self.publish(ChangeEvent::vote(ChangeKind::Delete, vote.clone()));
        Ok(Some(vote))
    }

    pub async fn get_vote(&self, vote_id: VoteId) -> Result<Option<Vote>> {
        let sql = format!("SELECT {VOTE_COLUMNS} FROM votes WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(vote_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(vote_from_row).transpose()
    }

    async fn closed_or_missing(&self, session_id: SessionId) -> Result<StoreError> {
        Ok(match self.get_session(session_id).await? {
            Some(_) => StoreError::new(
                ErrorCode::Validation,
                format!("session {session_id} is closed for voting"),
            ),
            None => StoreError::not_found(format!("session {session_id} does not exist")),
        })
    }
}

fn normalize_text(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .with_context(|| format!("invalid value {raw:?} in column '{column}'"))
}

fn session_from_row(row: &SqliteRow) -> Result<VotingSession> {
    Ok(VotingSession {
        id: parse_column(row, "id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: parse_column(row, "status")?,
        linked_item: row.try_get("linked_item")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        closed_at: row.try_get("closed_at")?,
    })
}

fn vote_from_row(row: &SqliteRow) -> Result<Vote> {
    Ok(Vote {
        id: parse_column(row, "id")?,
        session_id: parse_column(row, "session_id")?,
        participant_id: parse_column(row, "participant_id")?,
        ballot: parse_column(row, "ballot")?,
        justification: row.try_get("justification")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Creates the directory holding a file-backed sqlite database. Other urls
/// are left alone.
pub fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
