// crates/reverie-server/src/index/sqlite.rs
// SQLite-backed VectorBackend (memory_points / memory_manifests / memory_exclusions)

use super::backend::{Exclusions, PersistedIndex, VectorBackend};
use super::{Manifest, MemoryPoint};
use crate::db::{DatabasePool, format_timestamp, parse_timestamp};
use crate::error::{Result, ReverieError};
use crate::utils::{bytes_to_embedding, embedding_to_bytes};
use async_trait::async_trait;
use chrono::Utc;
use reverie_types::{ChatId, MessageId, Role};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct SqliteVectorBackend {
    pool: Arc<DatabasePool>,
}

impl SqliteVectorBackend {
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }
}

// ═══════════════════════════════════════
// SYNC HELPERS
// ═══════════════════════════════════════

fn insert_points_sync(conn: &Connection, chat_id: ChatId, points: &[MemoryPoint]) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO memory_points
             (chat_id, message_id, role, content_preview, created_at, indexed_at, embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(chat_id, message_id) DO UPDATE SET
             role = excluded.role,
             content_preview = excluded.content_preview,
             created_at = excluded.created_at,
             indexed_at = excluded.indexed_at,
             embedding = excluded.embedding",
    )?;
    for p in points {
        stmt.execute(params![
            chat_id,
            p.message_id,
            p.role.as_str(),
            p.content_preview,
            format_timestamp(&p.created_at),
            format_timestamp(&p.indexed_at),
            embedding_to_bytes(&p.vector),
        ])?;
    }
    Ok(())
}

fn write_manifest_sync(conn: &Connection, chat_id: ChatId, manifest: &Manifest) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO memory_manifests (chat_id, model_version, dimension, point_count, checksum, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(chat_id) DO UPDATE SET
             model_version = excluded.model_version,
             dimension = excluded.dimension,
             point_count = excluded.point_count,
             checksum = excluded.checksum,
             updated_at = excluded.updated_at",
        params![
            chat_id,
            manifest.model_version,
            manifest.dimension as i64,
            manifest.count as i64,
            manifest.checksum,
            format_timestamp(&Utc::now()),
        ],
    )?;
    Ok(())
}

fn read_manifest_sync(conn: &Connection, chat_id: ChatId) -> rusqlite::Result<Option<Manifest>> {
    conn.query_row(
        "SELECT model_version, dimension, point_count, checksum
         FROM memory_manifests WHERE chat_id = ?",
        [chat_id],
        |row| {
            Ok(Manifest {
                model_version: row.get(0)?,
                dimension: row.get::<_, i64>(1)? as usize,
                count: row.get::<_, i64>(2)? as usize,
                checksum: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Stored points; undecodable rows make the namespace unusable
fn read_points_sync(conn: &Connection, chat_id: ChatId) -> Result<Vec<MemoryPoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT message_id, role, content_preview, created_at, indexed_at, embedding
         FROM memory_points WHERE chat_id = ? ORDER BY message_id",
    )?;
    let rows = stmt.query_map([chat_id], |row| {
        let created_raw: String = row.get(3)?;
        let indexed_raw: String = row.get(4)?;
        Ok((
            row.get::<_, MessageId>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            parse_timestamp(3, &created_raw)?,
            parse_timestamp(4, &indexed_raw)?,
            row.get::<_, Vec<u8>>(5)?,
        ))
    })?;

    let mut points = Vec::new();
    for row in rows {
        let (message_id, role, content_preview, created_at, indexed_at, bytes) = row?;
        let role = Role::parse(&role).ok_or_else(|| {
            ReverieError::index_unavailable(chat_id, format!("unknown role '{role}'"))
        })?;
        let vector = bytes_to_embedding(&bytes).ok_or_else(|| {
            ReverieError::index_unavailable(
                chat_id,
                format!("corrupt vector bytes for message {message_id}"),
            )
        })?;
        points.push(MemoryPoint {
            message_id,
            role,
            content_preview,
            created_at,
            indexed_at,
            vector,
        });
    }
    Ok(points)
}

fn delete_namespace_rows_sync(conn: &Connection, chat_id: ChatId) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM memory_points WHERE chat_id = ?", [chat_id])?;
    conn.execute("DELETE FROM memory_manifests WHERE chat_id = ?", [chat_id])?;
    Ok(())
}

// ═══════════════════════════════════════
// BACKEND
// ═══════════════════════════════════════

#[async_trait]
impl VectorBackend for SqliteVectorBackend {
    async fn upsert(
        &self,
        chat_id: ChatId,
        points: &[MemoryPoint],
        manifest: &Manifest,
    ) -> Result<()> {
        let points = points.to_vec();
        let manifest = manifest.clone();
        self.pool
            .run_with_retry(move |conn| {
                let tx = conn.unchecked_transaction()?;
                insert_points_sync(&tx, chat_id, &points)?;
                write_manifest_sync(&tx, chat_id, &manifest)?;
                tx.commit()
            })
            .await
    }

    async fn delete(
        &self,
        chat_id: ChatId,
        ids: &[MessageId],
        manifest: Option<&Manifest>,
    ) -> Result<usize> {
        let ids = ids.to_vec();
        let manifest = manifest.cloned();
        self.pool
            .run_with_retry(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let mut removed = 0;
                {
                    let mut stmt = tx.prepare_cached(
                        "DELETE FROM memory_points WHERE chat_id = ? AND message_id = ?",
                    )?;
                    for id in &ids {
                        removed += stmt.execute(params![chat_id, id])?;
                    }
                }
                match &manifest {
                    Some(m) => write_manifest_sync(&tx, chat_id, m)?,
                    None => {
                        tx.execute("DELETE FROM memory_manifests WHERE chat_id = ?", [chat_id])?;
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(removed)
            })
            .await
    }

    async fn replace(
        &self,
        chat_id: ChatId,
        points: &[MemoryPoint],
        manifest: &Manifest,
    ) -> Result<()> {
        let points = points.to_vec();
        let manifest = manifest.clone();
        self.pool
            .run_with_retry(move |conn| {
                let tx = conn.unchecked_transaction()?;
                delete_namespace_rows_sync(&tx, chat_id)?;
                insert_points_sync(&tx, chat_id, &points)?;
                write_manifest_sync(&tx, chat_id, &manifest)?;
                tx.commit()
            })
            .await
    }

    async fn load(&self, chat_id: ChatId) -> Result<Option<PersistedIndex>> {
        self.pool
            .run(move |conn| {
                let Some(manifest) = read_manifest_sync(conn, chat_id)? else {
                    return Ok::<_, ReverieError>(None);
                };
                let points = read_points_sync(conn, chat_id)?;
                Ok(Some(PersistedIndex { manifest, points }))
            })
            .await
    }

    async fn load_points(&self, chat_id: ChatId) -> Result<Vec<MemoryPoint>> {
        self.pool
            .run(move |conn| read_points_sync(conn, chat_id))
            .await
    }

    async fn drop_namespace(&self, chat_id: ChatId) -> Result<()> {
        self.pool
            .run_with_retry(move |conn| {
                let tx = conn.unchecked_transaction()?;
                delete_namespace_rows_sync(&tx, chat_id)?;
                tx.execute("DELETE FROM memory_exclusions WHERE chat_id = ?", [chat_id])?;
                tx.commit()
            })
            .await
    }

    async fn load_exclusions(&self, chat_id: ChatId) -> Result<Exclusions> {
        self.pool
            .run(move |conn| {
                let row: Option<(Option<MessageId>, String)> = conn
                    .query_row(
                        "SELECT clear_watermark, forgotten FROM memory_exclusions WHERE chat_id = ?",
                        [chat_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((clear_watermark, forgotten)) = row else {
                    return Ok::<_, ReverieError>(Exclusions::default());
                };
                let forgotten: BTreeSet<MessageId> = serde_json::from_str(&forgotten)?;
                Ok(Exclusions {
                    forgotten,
                    clear_watermark,
                })
            })
            .await
    }

    async fn save_exclusions(&self, chat_id: ChatId, exclusions: &Exclusions) -> Result<()> {
        let forgotten = serde_json::to_string(&exclusions.forgotten)?;
        let watermark = exclusions.clear_watermark;
        self.pool
            .run_with_retry(move |conn| {
                conn.execute(
                    "INSERT INTO memory_exclusions (chat_id, clear_watermark, forgotten, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(chat_id) DO UPDATE SET
                         clear_watermark = excluded.clear_watermark,
                         forgotten = excluded.forgotten,
                         updated_at = excluded.updated_at",
                    params![chat_id, watermark, forgotten, format_timestamp(&Utc::now())],
                )
                .map(|_| ())
            })
            .await
    }

    async fn namespaces(&self) -> Result<Vec<ChatId>> {
        self.pool
            .run(|conn| {
                let mut stmt =
                    conn.prepare("SELECT chat_id FROM memory_manifests ORDER BY chat_id")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<ChatId>>>()?;
                Ok::<_, rusqlite::Error>(ids)
            })
            .await
    }
}
