//! Persistent schedule entries for proactive check-ins
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use super::{to_ts, ts_column, DbPool};
use crate::error::CareResult;
use crate::memory_db::schema::ScheduleEntry;

const ENTRY_COLUMNS: &str =
    "id, owner_id, trigger_spec, timezone, enabled, last_fired, next_fire, created_at";

pub struct ScheduleStore {
    pool: DbPool,
}

impl ScheduleStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> CareResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn insert(&self, entry: &ScheduleEntry) -> CareResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO schedule_entries
             (id, owner_id, trigger_spec, timezone, enabled, last_fired, next_fire, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &entry.id,
                &entry.owner_id,
                &entry.trigger_spec,
                &entry.timezone,
                entry.enabled,
                entry.last_fired.as_ref().map(to_ts),
                to_ts(&entry.next_fire),
                to_ts(&entry.created_at),
            ],
        )?;
        info!(
            "Scheduled '{}' for owner {} (next at {})",
            entry.trigger_spec, entry.owner_id, entry.next_fire
        );
        Ok(())
    }

    pub fn get(&self, id: &str) -> CareResult<Option<ScheduleEntry>> {
        let conn = self.get_conn()?;
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM schedule_entries WHERE id = ?1", ENTRY_COLUMNS),
                [id],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn list_for_owner(&self, owner_id: &str) -> CareResult<Vec<ScheduleEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedule_entries WHERE owner_id = ?1 ORDER BY created_at ASC",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([owner_id], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Enabled entries whose next firing is at or before `now`, earliest first.
    pub fn list_due(&self, now: DateTime<Utc>) -> CareResult<Vec<ScheduleEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedule_entries
             WHERE enabled = 1 AND next_fire <= ?1
             ORDER BY next_fire ASC",
            ENTRY_COLUMNS
        ))?;
        let entries = stmt
            .query_map([to_ts(&now)], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn earliest_next_fire(&self) -> CareResult<Option<DateTime<Utc>>> {
        let conn = self.get_conn()?;
        let raw: Option<String> = conn.query_row(
            "SELECT MIN(next_fire) FROM schedule_entries WHERE enabled = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|dt| dt.with_timezone(&Utc))))
    }

    pub fn record_firing(&self, id: &str, fired_at: DateTime<Utc>, next_fire: DateTime<Utc>) -> CareResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE schedule_entries SET last_fired = ?1, next_fire = ?2 WHERE id = ?3",
            params![to_ts(&fired_at), to_ts(&next_fire), id],
        )?;
        debug!("Schedule {} fired at {}, next at {}", id, fired_at, next_fire);
        Ok(())
    }

    /// Marks an on-demand firing; the regular next-fire stays put.
    pub fn record_manual_firing(&self, id: &str, fired_at: DateTime<Utc>) -> CareResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE schedule_entries SET last_fired = ?1 WHERE id = ?2",
            params![to_ts(&fired_at), id],
        )?;
        Ok(())
    }

    /// Rewrites the trigger, timezone, enabled flag and next-fire of an entry.
    pub fn update(&self, entry: &ScheduleEntry) -> CareResult<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE schedule_entries SET trigger_spec = ?1, timezone = ?2, enabled = ?3, next_fire = ?4
             WHERE id = ?5",
            params![
                &entry.trigger_spec,
                &entry.timezone,
                entry.enabled,
                to_ts(&entry.next_fire),
                &entry.id
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool, next_fire: DateTime<Utc>) -> CareResult<bool> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE schedule_entries SET enabled = ?1, next_fire = ?2 WHERE id = ?3",
            params![enabled, to_ts(&next_fire), id],
        )?;
        Ok(updated > 0)
    }

    pub fn delete(&self, id: &str) -> CareResult<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM schedule_entries WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    fn row_to_entry(row: &Row) -> rusqlite::Result<ScheduleEntry> {
        let last_fired = match row.get::<_, Option<String>>(5)? {
            Some(_) => Some(ts_column(row, 5)?),
            None => None,
        };
        Ok(ScheduleEntry {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            trigger_spec: row.get(2)?,
            timezone: row.get(3)?,
            enabled: row.get(4)?,
            last_fired,
            next_fire: ts_column(row, 6)?,
            created_at: ts_column(row, 7)?,
        })
    }
}
