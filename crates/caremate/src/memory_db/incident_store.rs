//! Append-only safety audit trail
use chrono::Utc;
use rusqlite::{params, Row};
use tracing::warn;

use super::{parsed_column, to_ts, ts_column, DbPool};
use crate::error::CareResult;
use crate::memory_db::schema::{NewIncident, SafetyIncident};

pub struct IncidentStore {
    pool: DbPool,
}

impl IncidentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn record(&self, incident: NewIncident<'_>) -> CareResult<SafetyIncident> {
        let conn = self.pool.get()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO safety_incidents
             (session_id, message_id, site, category, matched_signal, discarded_text, ruleset_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                incident.session_id,
                incident.message_id,
                incident.site.as_str(),
                incident.category.as_str(),
                incident.matched_signal,
                incident.discarded_text,
                incident.ruleset_version,
                to_ts(&now),
            ],
        )?;
        let id = conn.last_insert_rowid();

        warn!(
            session_id = incident.session_id,
            site = incident.site.as_str(),
            category = incident.category.as_str(),
            "Safety incident {} recorded",
            id
        );
        Ok(SafetyIncident {
            id,
            session_id: incident.session_id.to_string(),
            message_id: incident.message_id,
            site: incident.site,
            category: incident.category,
            matched_signal: incident.matched_signal.map(str::to_string),
            discarded_text: incident.discarded_text.map(str::to_string),
            ruleset_version: incident.ruleset_version.to_string(),
            created_at: now,
        })
    }

    pub fn list_for_session(&self, session_id: &str) -> CareResult<Vec<SafetyIncident>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, message_id, site, category, matched_signal, discarded_text,
                    ruleset_version, created_at
             FROM safety_incidents WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let incidents = stmt
            .query_map([session_id], Self::row_to_incident)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(incidents)
    }

    fn row_to_incident(row: &Row) -> rusqlite::Result<SafetyIncident> {
        Ok(SafetyIncident {
            id: row.get(0)?,
            session_id: row.get(1)?,
            message_id: row.get(2)?,
            site: parsed_column(row, 3)?,
            category: parsed_column(row, 4)?,
            matched_signal: row.get(5)?,
            discarded_text: row.get(6)?,
            ruleset_version: row.get(7)?,
            created_at: ts_column(row, 8)?,
        })
    }
}
