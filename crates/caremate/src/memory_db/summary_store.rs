//! Rolling summaries. One current summary per session; superseded ones are
//! kept for audit and never fed back into a context.
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::{to_ts, ts_column, DbPool};
use crate::error::CareResult;
use crate::memory_db::schema::*;

const SUMMARY_COLUMNS: &str = "s.id, s.session_id, s.summary_text, s.first_message_id, s.last_message_id,
     s.tokens, s.ruleset_version, s.is_current, s.generated_at";

#[derive(Debug, Clone)]
pub struct NewSummary<'a> {
    pub session_id: &'a str,
    pub summary_text: &'a str,
    pub first_message_id: i64,
    pub last_message_id: i64,
    pub tokens: i64,
    pub ruleset_version: &'a str,
}

pub struct SummaryStore {
    pool: DbPool,
}

impl SummaryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> CareResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Supersedes the session's current summary and stores `summary` as the new one.
    pub fn replace_current(&self, summary: NewSummary<'_>) -> CareResult<Summary> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        tx.execute(
            "UPDATE summaries SET is_current = 0 WHERE session_id = ?1 AND is_current = 1",
            [summary.session_id],
        )?;
        tx.execute(
            "INSERT INTO summaries
             (session_id, summary_text, first_message_id, last_message_id, tokens,
              ruleset_version, is_current, generated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
            params![
                summary.session_id,
                summary.summary_text,
                summary.first_message_id,
                summary.last_message_id,
                summary.tokens,
                summary.ruleset_version,
                to_ts(&now),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(
            "Stored summary {} for session {} (messages {}..={})",
            id, summary.session_id, summary.first_message_id, summary.last_message_id
        );
        Ok(Summary {
            id,
            session_id: summary.session_id.to_string(),
            summary_text: summary.summary_text.to_string(),
            first_message_id: summary.first_message_id,
            last_message_id: summary.last_message_id,
            tokens: summary.tokens,
            ruleset_version: summary.ruleset_version.to_string(),
            is_current: true,
            generated_at: now,
        })
    }

    pub fn current(&self, session_id: &str) -> CareResult<Option<Summary>> {
        let conn = self.get_conn()?;
        let summary = conn
            .query_row(
                &format!(
                    "SELECT {} FROM summaries s WHERE s.session_id = ?1 AND s.is_current = 1",
                    SUMMARY_COLUMNS
                ),
                [session_id],
                Self::row_to_summary,
            )
            .optional()?;
        Ok(summary)
    }

    /// All summaries of a session, oldest first, superseded ones included.
    pub fn list_for_session(&self, session_id: &str) -> CareResult<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM summaries s WHERE s.session_id = ?1 ORDER BY s.id ASC",
            SUMMARY_COLUMNS
        ))?;
        let summaries = stmt
            .query_map([session_id], Self::row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }

    /// Current summaries across every session the owner has.
    pub fn list_current_for_owner(&self, owner_id: &str) -> CareResult<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM summaries s
             JOIN sessions ON sessions.id = s.session_id
             WHERE sessions.owner_id = ?1 AND s.is_current = 1
             ORDER BY s.generated_at DESC",
            SUMMARY_COLUMNS
        ))?;
        let summaries = stmt
            .query_map([owner_id], Self::row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summaries)
    }

    fn row_to_summary(row: &Row) -> rusqlite::Result<Summary> {
        Ok(Summary {
            id: row.get(0)?,
            session_id: row.get(1)?,
            summary_text: row.get(2)?,
            first_message_id: row.get(3)?,
            last_message_id: row.get(4)?,
            tokens: row.get(5)?,
            ruleset_version: row.get(6)?,
            is_current: row.get(7)?,
            generated_at: ts_column(row, 8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;

    fn summary<'a>(session_id: &'a str, text: &'a str, last: i64) -> NewSummary<'a> {
        NewSummary {
            session_id,
            summary_text: text,
            first_message_id: 1,
            last_message_id: last,
            tokens: 12,
            ruleset_version: "v1",
        }
    }

    #[test]
    fn test_replace_keeps_one_current() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = db.conversations.create_session("alice").unwrap();

        db.summaries.replace_current(summary(&session.id, "first", 4)).unwrap();
        let second = db.summaries.replace_current(summary(&session.id, "second", 8)).unwrap();

        let current = db.summaries.current(&session.id).unwrap().unwrap();
        assert_eq!(current.id, second.id);
        assert_eq!(current.summary_text, "second");

        let all = db.summaries.list_for_session(&session.id).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().filter(|s| s.is_current).count(), 1);
        assert!(!all[0].is_current);
    }

    #[test]
    fn test_owner_listing_is_scoped() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let mine = db.conversations.create_session("alice").unwrap();
        let theirs = db.conversations.create_session("bob").unwrap();
        db.summaries.replace_current(summary(&mine.id, "mine", 2)).unwrap();
        db.summaries.replace_current(summary(&theirs.id, "theirs", 2)).unwrap();

        let listed = db.summaries.list_current_for_owner("alice").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, mine.id);
    }
}
