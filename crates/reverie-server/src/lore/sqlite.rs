// crates/reverie-server/src/lore/sqlite.rs
// Lorebook entries stored in SQLite

use super::LorebookSource;
use crate::db::{DatabasePool, format_timestamp};
use crate::error::{Result, ReverieError};
use async_trait::async_trait;
use chrono::Utc;
use reverie_types::{CharacterId, LorebookEntry, parse_keys};
use rusqlite::{Connection, params};
use std::sync::Arc;

fn entries_for_sync(conn: &Connection, character_id: CharacterId) -> rusqlite::Result<Vec<LorebookEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, character_id, keys, content, priority, is_enabled
         FROM lorebook_entries WHERE character_id = ? ORDER BY id",
    )?;
    let rows = stmt.query_map([character_id], |row| {
        let keys: String = row.get(2)?;
        Ok(LorebookEntry {
            id: row.get(0)?,
            character_id: row.get(1)?,
            keywords: parse_keys(&keys),
            injected_text: row.get(3)?,
            priority: row.get(4)?,
            enabled: row.get::<_, i64>(5)? != 0,
        })
    })?;
    rows.collect()
}

pub struct SqliteLorebookSource {
    pool: Arc<DatabasePool>,
}

impl SqliteLorebookSource {
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }

    /// Store an entry; `keys` is comma separated and needs at least one key
    pub async fn add_entry(
        &self,
        character_id: CharacterId,
        keys: &str,
        content: &str,
        priority: i32,
    ) -> Result<LorebookEntry> {
        let mut entry = LorebookEntry::from_keys(0, character_id, keys, content, priority);
        if entry.keywords.is_empty() {
            return Err(ReverieError::InvalidInput(
                "lorebook entry needs at least one keyword".into(),
            ));
        }
        if entry.injected_text.trim().is_empty() {
            return Err(ReverieError::InvalidInput(
                "lorebook entry content is empty".into(),
            ));
        }
        let keys = entry.keys_string();
        let content = entry.injected_text.clone();
        entry.id = self
            .pool
            .run_with_retry(move |conn| {
                conn.execute(
                    "INSERT INTO lorebook_entries (character_id, keys, content, priority, is_enabled, created_at)
                     VALUES (?, ?, ?, ?, 1, ?)",
                    params![character_id, keys, content, priority, format_timestamp(&Utc::now())],
                )?;
                Ok::<_, rusqlite::Error>(conn.last_insert_rowid())
            })
            .await?;
        Ok(entry)
    }

    /// Toggle an entry; returns false if it does not exist
    pub async fn set_enabled(&self, entry_id: i64, enabled: bool) -> Result<bool> {
        self.pool
            .run_with_retry(move |conn| {
                conn.execute(
                    "UPDATE lorebook_entries SET is_enabled = ? WHERE id = ?",
                    params![enabled as i64, entry_id],
                )
                .map(|n| n > 0)
            })
            .await
    }
}

#[async_trait]
impl LorebookSource for SqliteLorebookSource {
    async fn entries_for(&self, character_id: CharacterId) -> Result<Vec<LorebookEntry>> {
        self.pool
            .run(move |conn| entries_for_sync(conn, character_id))
            .await
    }
}
