//! Care database - SQLite storage for sessions, messages, summaries,
//! schedule entries, safety incidents and per-owner long-term memory.
pub mod conversation_store;
pub mod incident_store;
pub mod migration;
pub mod owner_memory_store;
pub mod schedule_store;
pub mod schema;
pub mod summary_store;

pub use conversation_store::ConversationStore;
pub use incident_store::IncidentStore;
pub use migration::MigrationManager;
pub use owner_memory_store::OwnerMemoryStore;
pub use schedule_store::ScheduleStore;
pub use schema::*;
pub use summary_store::{NewSummary, SummaryStore};

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::error::CareResult;

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;

/// Fixed-width UTC timestamps so that text comparison orders correctly.
pub(crate) fn to_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn parsed_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn connection_init(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
}

pub struct MemoryDatabase {
    pub conversations: ConversationStore,
    pub summaries: SummaryStore,
    pub schedules: ScheduleStore,
    pub incidents: IncidentStore,
    pub memories: OwnerMemoryStore,
    pool: DbPool,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path) -> CareResult<Self> {
        info!("Opening care database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::error::CareError::Persistence(format!("creating {}: {}", parent.display(), e))
                })?;
            }
        }
        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(connection_init);
        let pool = Pool::builder().max_size(8).build(manager)?;

        {
            let mut conn = pool.get()?;
            let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            info!("Journal mode: {}", mode);
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        info!("Care database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Private database for tests and one-off tools. Single connection, since
    /// every in-memory connection would otherwise see its own empty database.
    pub fn new_in_memory() -> CareResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(connection_init);
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: DbPool) -> Self {
        Self {
            conversations: ConversationStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            schedules: ScheduleStore::new(Arc::clone(&pool)),
            incidents: IncidentStore::new(Arc::clone(&pool)),
            memories: OwnerMemoryStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn get_stats(&self) -> CareResult<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    #[cfg(test)]
    pub(crate) fn raw_connection(
        &self,
    ) -> CareResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Cheap liveness probe for health endpoints.
    pub fn ping(&self) -> CareResult<()> {
        let conn = self.pool.get()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
