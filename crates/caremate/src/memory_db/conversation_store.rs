//! Sessions and their append-only message log
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use super::{parsed_column, to_ts, ts_column, DbPool};
use crate::error::CareResult;
use crate::memory_db::schema::*;

const SESSION_COLUMNS: &str = "id, owner_id, status, created_at, last_accessed, metadata";
const MESSAGE_COLUMNS: &str = "id, session_id, message_index, role, content, tokens, safety_flag, timestamp";

pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> CareResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn create_session(&self, owner_id: &str) -> CareResult<Session> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            status: SessionStatus::Active,
            created_at: Utc::now(),
            last_accessed: Utc::now(),
            metadata: SessionMetadata::default(),
        };

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO sessions (id, owner_id, status, created_at, last_accessed, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &session.id,
                &session.owner_id,
                session.status.as_str(),
                to_ts(&session.created_at),
                to_ts(&session.last_accessed),
                serde_json::to_string(&session.metadata)?,
            ],
        )?;

        info!("Created session {} for owner {}", session.id, owner_id);
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> CareResult<Option<Session>> {
        let conn = self.get_conn()?;
        let session = conn
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                [session_id],
                Self::row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Newest activity first.
    pub fn list_sessions(&self, owner_id: &str) -> CareResult<Vec<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE owner_id = ?1 ORDER BY last_accessed DESC",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([owner_id], Self::row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Most recently used active session with activity at or after `since`.
    pub fn most_recent_active(&self, owner_id: &str, since: DateTime<Utc>) -> CareResult<Option<Session>> {
        let conn = self.get_conn()?;
        let session = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions
                     WHERE owner_id = ?1 AND status = 'active' AND last_accessed >= ?2
                     ORDER BY last_accessed DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                params![owner_id, to_ts(&since)],
                Self::row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> CareResult<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE sessions SET status = ?1 WHERE id = ?2",
            params![status.as_str(), session_id],
        )?;
        Ok(updated > 0)
    }

    pub fn update_metadata(&self, session_id: &str, metadata: &SessionMetadata) -> CareResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sessions SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(metadata)?, session_id],
        )?;
        Ok(())
    }

    /// Removes the session together with its messages, summaries and incidents.
    pub fn delete_session(&self, session_id: &str) -> CareResult<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])?;
        Ok(deleted > 0)
    }

    /// Appends at the next per-session index and bumps the session's activity time.
    pub fn append_message(&self, message: NewMessage<'_>) -> CareResult<StoredMessage> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let message_index: i64 = tx.query_row(
            "SELECT COALESCE(MAX(message_index) + 1, 0) FROM messages WHERE session_id = ?1",
            [message.session_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO messages
             (session_id, message_index, role, content, tokens, safety_flag, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.session_id,
                message_index,
                message.role.as_str(),
                message.content,
                message.tokens,
                message.safety_flag.as_str(),
                to_ts(&now),
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE sessions SET last_accessed = ?1 WHERE id = ?2",
            params![to_ts(&now), message.session_id],
        )?;
        tx.commit()?;

        debug!(
            "Stored {} message #{} in session {}",
            message.role, message_index, message.session_id
        );
        Ok(StoredMessage {
            id,
            session_id: message.session_id.to_string(),
            message_index,
            role: message.role,
            content: message.content.to_string(),
            tokens: message.tokens,
            safety_flag: message.safety_flag,
            timestamp: now,
        })
    }

    pub fn get_messages(&self, session_id: &str) -> CareResult<Vec<StoredMessage>> {
        self.get_messages_after(session_id, 0)
    }

    /// Messages with an id greater than `after_id`, oldest first.
    pub fn get_messages_after(&self, session_id: &str, after_id: i64) -> CareResult<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages WHERE session_id = ?1 AND id > ?2 ORDER BY message_index ASC",
            MESSAGE_COLUMNS
        ))?;
        let messages = stmt
            .query_map(params![session_id, after_id], Self::row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Newest `limit` messages the owner wrote or received outside
    /// `exclude_session` since `since`, returned oldest first.
    pub fn recent_owner_messages(
        &self,
        owner_id: &str,
        exclude_session: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> CareResult<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.session_id, m.message_index, m.role, m.content, m.tokens, m.safety_flag, m.timestamp
             FROM messages m JOIN sessions s ON s.id = m.session_id
             WHERE s.owner_id = ?1 AND m.session_id != ?2 AND m.timestamp >= ?3
             ORDER BY m.id DESC
             LIMIT ?4",
        )?;
        let mut messages = stmt
            .query_map(
                params![owner_id, exclude_session, to_ts(&since), limit as i64],
                Self::row_to_message,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub fn count_messages(&self, session_id: &str) -> CareResult<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drops sessions with no activity since `cutoff`; returns how many went.
    pub fn delete_inactive_since(&self, cutoff: DateTime<Utc>) -> CareResult<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM sessions WHERE last_accessed < ?1",
            [to_ts(&cutoff)],
        )?;
        if deleted > 0 {
            info!("Cleaned up {} inactive sessions", deleted);
        }
        Ok(deleted)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        let metadata_json: String = row.get(5)?;
        let metadata: SessionMetadata = serde_json::from_str(&metadata_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(Session {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            status: parsed_column(row, 2)?,
            created_at: ts_column(row, 3)?,
            last_accessed: ts_column(row, 4)?,
            metadata,
        })
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
        Ok(StoredMessage {
            id: row.get(0)?,
            session_id: row.get(1)?,
            message_index: row.get(2)?,
            role: parsed_column(row, 3)?,
            content: row.get(4)?,
            tokens: row.get(5)?,
            safety_flag: parsed_column(row, 6)?,
            timestamp: ts_column(row, 7)?,
        })
    }
}
