// crates/reverie-server/src/index/backend.rs
// Durable storage beneath VectorIndex, namespaced by chat id

use super::{Manifest, MemoryPoint};
use crate::error::Result;
use async_trait::async_trait;
use reverie_types::{ChatId, MessageId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Everything stored for one chat's index
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedIndex {
    pub manifest: Manifest,
    pub points: Vec<MemoryPoint>,
}

/// Messages that must never be (re)indexed: individually forgotten ids plus
/// everything at or below the last clear watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusions {
    pub forgotten: BTreeSet<MessageId>,
    pub clear_watermark: Option<MessageId>,
}

impl Exclusions {
    pub fn excludes(&self, message_id: MessageId) -> bool {
        self.clear_watermark.is_some_and(|w| message_id <= w) || self.forgotten.contains(&message_id)
    }

    /// Raise the watermark; forgotten ids it now covers are dropped.
    pub fn raise_watermark(&mut self, watermark: MessageId) {
        let watermark = self.clear_watermark.map_or(watermark, |w| w.max(watermark));
        self.clear_watermark = Some(watermark);
        self.forgotten.retain(|id| *id > watermark);
    }

    pub fn is_empty(&self) -> bool {
        self.forgotten.is_empty() && self.clear_watermark.is_none()
    }
}

/// Namespace-scoped persistence. Every write carries the manifest describing
/// the namespace after the write, stored atomically with the points.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn upsert(&self, chat_id: ChatId, points: &[MemoryPoint], manifest: &Manifest)
    -> Result<()>;

    /// Delete points; returns how many existed. A `None` manifest invalidates
    /// the namespace so the next load rebuilds it.
    async fn delete(
        &self,
        chat_id: ChatId,
        ids: &[MessageId],
        manifest: Option<&Manifest>,
    ) -> Result<usize>;

    /// Replace the whole namespace (rebuild swap, clear)
    async fn replace(&self, chat_id: ChatId, points: &[MemoryPoint], manifest: &Manifest)
    -> Result<()>;

    /// Load a namespace; `None` when nothing was ever persisted
    async fn load(&self, chat_id: ChatId) -> Result<Option<PersistedIndex>>;

    /// Stored points regardless of manifest validity
    async fn load_points(&self, chat_id: ChatId) -> Result<Vec<MemoryPoint>>;

    /// Remove points, manifest and exclusions
    async fn drop_namespace(&self, chat_id: ChatId) -> Result<()>;

    async fn load_exclusions(&self, chat_id: ChatId) -> Result<Exclusions>;

    async fn save_exclusions(&self, chat_id: ChatId, exclusions: &Exclusions) -> Result<()>;

    /// Chats with a persisted manifest
    async fn namespaces(&self) -> Result<Vec<ChatId>>;
}
