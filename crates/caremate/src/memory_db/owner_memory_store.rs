//! Per-owner long-term memory: one digest row per owner, overwritten on refresh.
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use super::{to_ts, ts_column, DbPool};
use crate::error::CareResult;
use crate::memory_db::schema::OwnerMemory;

pub struct OwnerMemoryStore {
    pool: DbPool,
}

impl OwnerMemoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> CareResult<r2d2::PooledConnection<r2d2_sqlite::SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn get(&self, owner_id: &str) -> CareResult<Option<OwnerMemory>> {
        let conn = self.get_conn()?;
        let memory = conn
            .query_row(
                "SELECT owner_id, digest, tokens, source_messages, last_source_message_id,
                        ruleset_version, refreshed_at
                 FROM owner_memory WHERE owner_id = ?1",
                [owner_id],
                Self::row_to_memory,
            )
            .optional()?;
        Ok(memory)
    }

    pub fn upsert(&self, memory: &OwnerMemory) -> CareResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO owner_memory
             (owner_id, digest, tokens, source_messages, last_source_message_id, ruleset_version, refreshed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(owner_id) DO UPDATE SET
                digest = excluded.digest,
                tokens = excluded.tokens,
                source_messages = excluded.source_messages,
                last_source_message_id = excluded.last_source_message_id,
                ruleset_version = excluded.ruleset_version,
                refreshed_at = excluded.refreshed_at",
            params![
                &memory.owner_id,
                &memory.digest,
                memory.tokens,
                memory.source_messages,
                memory.last_source_message_id,
                &memory.ruleset_version,
                to_ts(&memory.refreshed_at),
            ],
        )?;
        debug!("Refreshed long-term memory for {}", memory.owner_id);
        Ok(())
    }

    /// Drops digests of owners who no longer have any session.
    pub fn delete_orphaned(&self) -> CareResult<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM owner_memory WHERE owner_id NOT IN (SELECT owner_id FROM sessions)",
            [],
        )?;
        Ok(deleted)
    }

    fn row_to_memory(row: &Row) -> rusqlite::Result<OwnerMemory> {
        Ok(OwnerMemory {
            owner_id: row.get(0)?,
            digest: row.get(1)?,
            tokens: row.get(2)?,
            source_messages: row.get(3)?,
            last_source_message_id: row.get(4)?,
            ruleset_version: row.get(5)?,
            refreshed_at: ts_column(row, 6)?,
        })
    }
}
