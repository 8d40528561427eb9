// crates/reverie-server/src/db/schema.rs
// Database schema and migrations

use super::migration_helpers::{add_column_if_missing, create_table_if_missing};
use anyhow::Result;
use rusqlite::Connection;

/// Run all schema setup and migrations.
///
/// Idempotent: checks for existing tables and columns before changing them.
pub fn run_all_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    migrate_lorebook_priority(conn)?;
    migrate_memory_exclusions(conn)?;

    Ok(())
}

/// Lorebooks created before priorities existed have neither column.
fn migrate_lorebook_priority(conn: &Connection) -> Result<()> {
    add_column_if_missing(
        conn,
        "lorebook_entries",
        "priority",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    add_column_if_missing(
        conn,
        "lorebook_entries",
        "is_enabled",
        "INTEGER NOT NULL DEFAULT 1",
    )?;
    Ok(())
}

fn migrate_memory_exclusions(conn: &Connection) -> Result<()> {
    create_table_if_missing(
        conn,
        "memory_exclusions",
        r#"
        CREATE TABLE memory_exclusions (
            chat_id INTEGER PRIMARY KEY,
            clear_watermark INTEGER,
            forgotten TEXT NOT NULL DEFAULT '[]',
            updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );
        "#,
    )
}

pub const SCHEMA: &str = r#"
-- =======================================
-- TRANSCRIPT (authoritative)
-- =======================================
CREATE TABLE IF NOT EXISTS chats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    character_id INTEGER NOT NULL,
    title TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id, id);

-- =======================================
-- LORE
-- =======================================
CREATE TABLE IF NOT EXISTS lorebook_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    character_id INTEGER NOT NULL,
    keys TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_lorebook_character ON lorebook_entries(character_id);

-- =======================================
-- MEMORY (derived, rebuildable)
-- =======================================
CREATE TABLE IF NOT EXISTS memory_points (
    chat_id INTEGER NOT NULL,
    message_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    content_preview TEXT NOT NULL,
    created_at TEXT NOT NULL,
    indexed_at TEXT NOT NULL,
    embedding BLOB NOT NULL,
    PRIMARY KEY (chat_id, message_id)
);

CREATE TABLE IF NOT EXISTS memory_manifests (
    chat_id INTEGER PRIMARY KEY,
    model_version TEXT NOT NULL,
    dimension INTEGER NOT NULL,
    point_count INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migration_helpers::{column_exists, table_exists};

    #[test]
    fn test_migrations_create_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        for table in [
            "chats",
            "messages",
            "lorebook_entries",
            "memory_points",
            "memory_manifests",
            "memory_exclusions",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        run_all_migrations(&conn).unwrap();
    }

    #[test]
    fn test_legacy_lorebook_gains_priority_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE lorebook_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                character_id INTEGER NOT NULL,
                keys TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT 'x'
            );
            INSERT INTO lorebook_entries (character_id, keys, content) VALUES (1, 'a', 'b');",
        )
        .unwrap();

        run_all_migrations(&conn).unwrap();

        assert!(column_exists(&conn, "lorebook_entries", "priority"));
        let (priority, enabled): (i32, bool) = conn
            .query_row(
                "SELECT priority, is_enabled FROM lorebook_entries",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(priority, 0);
        assert!(enabled);
    }
}
