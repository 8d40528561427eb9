// crates/reverie-server/src/store/sqlite.rs
// SQLite transcript: chats and messages

use super::MessageStore;
use crate::db::{DatabasePool, format_timestamp, parse_timestamp};
use crate::error::{Result, ReverieError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reverie_types::{CharacterId, ChatId, Message, MessageId, Role};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::sync::Arc;

const MESSAGE_COLUMNS: &str = "id, chat_id, role, content, created_at";

/// Parse a `messages` row selected with MESSAGE_COLUMNS
pub fn parse_message_row(row: &Row) -> rusqlite::Result<Message> {
    let role_raw: String = row.get(2)?;
    let role = Role::parse(&role_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown role '{role_raw}'").into(),
        )
    })?;
    let created_raw: String = row.get(4)?;
    Ok(Message {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role,
        content: row.get(3)?,
        created_at: parse_timestamp(4, &created_raw)?,
    })
}

/// A chat row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatSummary {
    pub id: ChatId,
    pub character_id: CharacterId,
    pub title: Option<String>,
    pub message_count: usize,
}

pub fn create_chat_sync(
    conn: &Connection,
    character_id: CharacterId,
    title: Option<&str>,
) -> rusqlite::Result<ChatId> {
    conn.execute(
        "INSERT INTO chats (character_id, title) VALUES (?, ?)",
        params![character_id, title],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_message_sync(
    conn: &Connection,
    chat_id: ChatId,
    role: Role,
    content: &str,
    created_at: DateTime<Utc>,
) -> rusqlite::Result<Message> {
    let stamp = format_timestamp(&created_at);
    conn.execute(
        "INSERT INTO messages (chat_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        params![chat_id, role.as_str(), content, stamp],
    )?;
    // Hand back the timestamp as it reads from the row
    Ok(Message {
        id: conn.last_insert_rowid(),
        chat_id,
        role,
        content: content.to_string(),
        created_at: parse_timestamp(4, &stamp)?,
    })
}

fn chat_exists_sync(conn: &Connection, chat_id: ChatId) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM chats WHERE id = ?", [chat_id], |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
}

/// Transcript store over the shared pool. Write methods are inherent: they
/// belong to the chat platform, not to the memory layer.
pub struct SqliteMessageStore {
    pool: Arc<DatabasePool>,
}

impl SqliteMessageStore {
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }

    pub async fn create_chat(
        &self,
        character_id: CharacterId,
        title: Option<String>,
    ) -> Result<ChatId> {
        self.pool
            .run_with_retry(move |conn| create_chat_sync(conn, character_id, title.as_deref()))
            .await
    }

    pub async fn chat(&self, chat_id: ChatId) -> Result<Option<ChatSummary>> {
        self.pool
            .run(move |conn| {
                conn.query_row(
                    "SELECT c.id, c.character_id, c.title,
                            (SELECT COUNT(*) FROM messages m WHERE m.chat_id = c.id)
                     FROM chats c WHERE c.id = ?",
                    [chat_id],
                    |row| {
                        Ok(ChatSummary {
                            id: row.get(0)?,
                            character_id: row.get(1)?,
                            title: row.get(2)?,
                            message_count: row.get::<_, i64>(3)? as usize,
                        })
                    },
                )
                .optional()
            })
            .await
    }

    /// Append a message. Fails with NotFound for an unknown chat.
    pub async fn insert_message(
        &self,
        chat_id: ChatId,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Message> {
        let content = content.into();
        let created_at = Utc::now();
        self.pool
            .run_with_retry(move |conn| {
                if !chat_exists_sync(conn, chat_id)? {
                    return Err(ReverieError::NotFound(format!("chat {chat_id}")));
                }
                Ok(insert_message_sync(conn, chat_id, role, &content, created_at)?)
            })
            .await
    }

    /// Delete the chat and (by cascade) its messages; returns whether it existed
    pub async fn delete_chat(&self, chat_id: ChatId) -> Result<bool> {
        self.pool
            .run_with_retry(move |conn| {
                conn.execute("DELETE FROM chats WHERE id = ?", [chat_id])
                    .map(|n| n > 0)
            })
            .await
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn get_messages(
        &self,
        chat_id: ChatId,
        since_id: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        self.pool
            .run(move |conn| {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_id = ? AND id > ? ORDER BY id"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                stmt.query_map(params![chat_id, since_id.unwrap_or(0)], parse_message_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .await
    }

    async fn get_message(&self, message_id: MessageId) -> Result<Option<Message>> {
        self.pool
            .run(move |conn| {
                let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?");
                conn.query_row(&sql, [message_id], parse_message_row)
                    .optional()
            })
            .await
    }

    async fn recent_messages(&self, chat_id: ChatId, n: usize) -> Result<Vec<Message>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        self.pool
            .run(move |conn| {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE chat_id = ? ORDER BY id DESC LIMIT ?"
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                let mut messages = stmt
                    .query_map(params![chat_id, n as i64], parse_message_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                messages.reverse();
                Ok::<_, rusqlite::Error>(messages)
            })
            .await
    }

    async fn latest_message_id(&self, chat_id: ChatId) -> Result<Option<MessageId>> {
        self.pool
            .run(move |conn| {
                conn.query_row(
                    "SELECT MAX(id) FROM messages WHERE chat_id = ?",
                    [chat_id],
                    |row| row.get::<_, Option<MessageId>>(0),
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_pool;

    async fn store_with_chat() -> (SqliteMessageStore, ChatId) {
        let store = SqliteMessageStore::new(setup_test_pool().await);
        let chat_id = store.create_chat(1, Some("tavern".into())).await.unwrap();
        (store, chat_id)
    }

    #[tokio::test]
    async fn test_insert_and_get_messages() {
        let (store, chat_id) = store_with_chat().await;
        let first = store.insert_message(chat_id, Role::User, "hello").await.unwrap();
        let second = store
            .insert_message(chat_id, Role::Assistant, "well met")
            .await
            .unwrap();

        let all = store.get_messages(chat_id, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], first);
        assert_eq!(first.created_at.timestamp_subsec_nanos() % 1_000_000, 0);

        let since = store.get_messages(chat_id, Some(first.id)).await.unwrap();
        assert_eq!(since, vec![second.clone()]);

        assert_eq!(store.get_message(second.id).await.unwrap(), Some(second.clone()));
        assert_eq!(store.latest_message_id(chat_id).await.unwrap(), Some(second.id));
    }

    #[tokio::test]
    async fn test_recent_messages_are_chronological() {
        let (store, chat_id) = store_with_chat().await;
        for i in 0..6 {
            store
                .insert_message(chat_id, Role::User, format!("line {i}"))
                .await
                .unwrap();
        }
        let recent = store.recent_messages(chat_id, 3).await.unwrap();
        let contents: Vec<_> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["line 3", "line 4", "line 5"]);
        assert!(store.recent_messages(chat_id, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_into_unknown_chat_is_not_found() {
        let store = SqliteMessageStore::new(setup_test_pool().await);
        let err = store.insert_message(42, Role::User, "hi").await.unwrap_err();
        assert!(matches!(err, ReverieError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_chat_cascades() {
        let (store, chat_id) = store_with_chat().await;
        let msg = store.insert_message(chat_id, Role::User, "bye").await.unwrap();
        assert_eq!(store.chat(chat_id).await.unwrap().unwrap().message_count, 1);

        assert!(store.delete_chat(chat_id).await.unwrap());
        assert!(store.get_message(msg.id).await.unwrap().is_none());
        assert!(store.chat(chat_id).await.unwrap().is_none());
        assert_eq!(store.latest_message_id(chat_id).await.unwrap(), None);
        assert!(!store.delete_chat(chat_id).await.unwrap());
    }
}
