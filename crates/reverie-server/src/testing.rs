// crates/reverie-server/src/testing.rs
// Deterministic fakes for the provider, transcript and vector store seams

use crate::embeddings::{EmbeddingProvider, ProviderError, check_model_version};
use crate::error::{Result, ReverieError};
use crate::index::{Exclusions, Manifest, MemoryPoint, PersistedIndex, VectorBackend};
use crate::store::MessageStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reverie_types::{ChatId, Message, MessageId, Role};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ═══════════════════════════════════════
// EMBEDDER
// ═══════════════════════════════════════

/// Words that load a dedicated axis each. Everything else is spread thinly
/// over the residual axes, so texts sharing a topic word score high and
/// unrelated texts stay well below 0.7.
const TOPICS: &[&[&str]] = &[
    &["dragon", "dragons", "wyrm", "wyrms"],
    &["capital", "city", "citadel"],
    &["rain", "storm", "weather", "sun"],
    &["bread", "stew", "ale", "tavern"],
    &["sword", "blade", "swords"],
    &["sea", "ship", "sail", "harbor"],
    &["magic", "spell", "wizard", "spells"],
    &["horse", "horses", "ride", "stable"],
];

pub const SCRIPTED_DIMENSIONS: usize = 32;
const RESIDUAL_WEIGHT: f32 = 0.15;

#[derive(Default)]
struct FailPlan {
    always: Option<ProviderError>,
    next: usize,
    next_error: Option<ProviderError>,
}

/// Topic-axis embedder with failure switches and call counters
pub struct ScriptedEmbedder {
    model_version: String,
    latency: Duration,
    fail: Mutex<FailPlan>,
    calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl Default for ScriptedEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self {
            model_version: "scripted-v1".to_string(),
            latency: Duration::ZERO,
            fail: Mutex::new(FailPlan::default()),
            calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every call with `error` until cleared with `None`
    pub fn fail_with(&self, error: Option<ProviderError>) {
        lock(&self.fail).always = error;
    }

    /// Fail only the next `n` calls
    pub fn fail_next(&self, n: usize, error: ProviderError) {
        let mut plan = lock(&self.fail);
        plan.next = n;
        plan.next_error = Some(error);
    }

    /// Texts sent to the provider, failed attempts included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// The vector `embed` returns for `text`, unnormalized
    pub fn vector_for(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; SCRIPTED_DIMENSIONS];
        let residual = SCRIPTED_DIMENSIONS - TOPICS.len();
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            match TOPICS.iter().position(|words| words.contains(&word)) {
                Some(axis) => v[axis] += 1.0,
                None => {
                    let bucket = word
                        .bytes()
                        .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
                    v[TOPICS.len() + bucket % residual] += RESIDUAL_WEIGHT;
                }
            }
        }
        v
    }

    async fn attempt(
        &self,
        texts: usize,
        model_version: &str,
    ) -> std::result::Result<(), ProviderError> {
        self.calls.fetch_add(texts, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        {
            let mut plan = lock(&self.fail);
            if let Some(e) = &plan.always {
                return Err(e.clone());
            }
            if plan.next > 0 {
                plan.next -= 1;
                if let Some(e) = &plan.next_error {
                    return Err(e.clone());
                }
            }
        }
        check_model_version(&self.model_version, model_version)
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimensions(&self) -> usize {
        SCRIPTED_DIMENSIONS
    }

    async fn embed(
        &self,
        text: &str,
        model_version: &str,
    ) -> std::result::Result<Vec<f32>, ProviderError> {
        self.attempt(1, model_version).await?;
        Ok(Self::vector_for(text))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        model_version: &str,
    ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.attempt(texts.len(), model_version).await?;
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }
}

// ═══════════════════════════════════════
// MESSAGE STORE
// ═══════════════════════════════════════

/// Transcript held in memory. Ids are global and increasing; timestamps are
/// one minute apart in insertion order.
pub struct InMemoryMessageStore {
    messages: Mutex<BTreeMap<MessageId, Message>>,
    next_id: AtomicI64,
    unreachable: AtomicBool,
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            unreachable: AtomicBool::new(false),
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn push(&self, chat_id: ChatId, role: Role, content: impl Into<String>) -> Message {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message {
            id,
            chat_id,
            role,
            content: content.into(),
            created_at: Self::base_time() + ChronoDuration::minutes(id),
        };
        lock(&self.messages).insert(id, message.clone());
        message
    }

    /// Every call fails with StoreUnavailable while set
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn remove_message(&self, message_id: MessageId) -> bool {
        lock(&self.messages).remove(&message_id).is_some()
    }

    pub fn remove_chat(&self, chat_id: ChatId) {
        lock(&self.messages).retain(|_, m| m.chat_id != chat_id);
    }

    fn check(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ReverieError::StoreUnavailable("message store unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn get_messages(
        &self,
        chat_id: ChatId,
        since_id: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        self.check()?;
        Ok(lock(&self.messages)
            .values()
            .filter(|m| m.chat_id == chat_id && since_id.is_none_or(|s| m.id > s))
            .cloned()
            .collect())
    }

    async fn get_message(&self, message_id: MessageId) -> Result<Option<Message>> {
        self.check()?;
        Ok(lock(&self.messages).get(&message_id).cloned())
    }

    async fn recent_messages(&self, chat_id: ChatId, n: usize) -> Result<Vec<Message>> {
        self.check()?;
        let messages = lock(&self.messages);
        let mut recent: Vec<Message> = messages
            .values()
            .rev()
            .filter(|m| m.chat_id == chat_id)
            .take(n)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn latest_message_id(&self, chat_id: ChatId) -> Result<Option<MessageId>> {
        self.check()?;
        Ok(lock(&self.messages)
            .values()
            .rev()
            .find(|m| m.chat_id == chat_id)
            .map(|m| m.id))
    }
}

// ═══════════════════════════════════════
// VECTOR BACKEND
// ═══════════════════════════════════════

#[derive(Default, Clone)]
struct Namespace {
    points: BTreeMap<MessageId, MemoryPoint>,
    manifest: Option<Manifest>,
    exclusions: Exclusions,
}

/// Vector backend held in memory, with corruption and outage injection
#[derive(Default)]
pub struct InMemoryVectorBackend {
    namespaces: Mutex<HashMap<ChatId, Namespace>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryVectorBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of successful write calls
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Flip one stored vector so the manifest checksum no longer matches.
    /// Returns false when the namespace has no points.
    pub fn corrupt(&self, chat_id: ChatId) -> bool {
        let mut namespaces = lock(&self.namespaces);
        let Some(point) = namespaces
            .get_mut(&chat_id)
            .and_then(|ns| ns.points.values_mut().next())
        else {
            return false;
        };
        if let Some(x) = point.vector.first_mut() {
            *x += 1.0;
        }
        true
    }

    pub fn manifest(&self, chat_id: ChatId) -> Option<Manifest> {
        lock(&self.namespaces)
            .get(&chat_id)
            .and_then(|ns| ns.manifest.clone())
    }

    pub fn point_ids(&self, chat_id: ChatId) -> Vec<MessageId> {
        lock(&self.namespaces)
            .get(&chat_id)
            .map(|ns| ns.points.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_namespace(&self, chat_id: ChatId) -> bool {
        lock(&self.namespaces).contains_key(&chat_id)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ReverieError::StoreUnavailable("vector backend unavailable".into()));
        }
        Ok(())
    }

    fn write<T>(&self, chat_id: ChatId, f: impl FnOnce(&mut Namespace) -> T) -> Result<T> {
        self.check()?;
        let mut namespaces = lock(&self.namespaces);
        let out = f(namespaces.entry(chat_id).or_default());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(out)
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorBackend {
    async fn upsert(
        &self,
        chat_id: ChatId,
        points: &[MemoryPoint],
        manifest: &Manifest,
    ) -> Result<()> {
        self.write(chat_id, |ns| {
            for p in points {
                ns.points.insert(p.message_id, p.clone());
            }
            ns.manifest = Some(manifest.clone());
        })
    }

    async fn delete(
        &self,
        chat_id: ChatId,
        ids: &[MessageId],
        manifest: Option<&Manifest>,
    ) -> Result<usize> {
        self.write(chat_id, |ns| {
            let removed = ids.iter().filter(|id| ns.points.remove(id).is_some()).count();
            ns.manifest = manifest.cloned();
            removed
        })
    }

    async fn replace(
        &self,
        chat_id: ChatId,
        points: &[MemoryPoint],
        manifest: &Manifest,
    ) -> Result<()> {
        self.write(chat_id, |ns| {
            ns.points = points.iter().map(|p| (p.message_id, p.clone())).collect();
            ns.manifest = Some(manifest.clone());
        })
    }

    async fn load(&self, chat_id: ChatId) -> Result<Option<PersistedIndex>> {
        self.check()?;
        let namespaces = lock(&self.namespaces);
        Ok(namespaces.get(&chat_id).and_then(|ns| {
            ns.manifest.as_ref().map(|manifest| PersistedIndex {
                manifest: manifest.clone(),
                points: ns.points.values().cloned().collect(),
            })
        }))
    }

    async fn load_points(&self, chat_id: ChatId) -> Result<Vec<MemoryPoint>> {
        self.check()?;
        Ok(lock(&self.namespaces)
            .get(&chat_id)
            .map(|ns| ns.points.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn drop_namespace(&self, chat_id: ChatId) -> Result<()> {
        self.check()?;
        lock(&self.namespaces).remove(&chat_id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_exclusions(&self, chat_id: ChatId) -> Result<Exclusions> {
        self.check()?;
        Ok(lock(&self.namespaces)
            .get(&chat_id)
            .map(|ns| ns.exclusions.clone())
            .unwrap_or_default())
    }

    async fn save_exclusions(&self, chat_id: ChatId, exclusions: &Exclusions) -> Result<()> {
        self.write(chat_id, |ns| ns.exclusions = exclusions.clone())
    }

    async fn namespaces(&self) -> Result<Vec<ChatId>> {
        self.check()?;
        let mut ids: Vec<ChatId> = lock(&self.namespaces)
            .iter()
            .filter(|(_, ns)| ns.manifest.is_some())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
