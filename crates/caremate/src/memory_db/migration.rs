//! Database migration system

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use crate::memory_db::schema;

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Brings the schema up to the latest version.
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing care database schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current database schema version: {}", current_version);

        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?1",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
    }
}

pub fn latest_version() -> i32 {
    get_migrations().last().map(|(v, _)| *v).unwrap_or(0)
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_schedules_and_incidents.sql")),
        (3, include_str!("migrations/003_owner_memory.sql")),
    ]
}

pub fn get_database_stats(conn: &Connection) -> Result<schema::DatabaseStats> {
    fn get_table_count(conn: &Connection, table_name: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table_name), [], |row| row.get(0))
            .unwrap_or_else(|e| {
                warn!("Failed to get count from table {}: {}", table_name, e);
                0
            })
    }

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(schema::DatabaseStats {
        total_sessions: get_table_count(conn, "sessions"),
        total_messages: get_table_count(conn, "messages"),
        total_summaries: get_table_count(conn, "summaries"),
        total_schedules: get_table_count(conn, "schedule_entries"),
        total_incidents: get_table_count(conn, "safety_incidents"),
        database_size_bytes,
    })
}
