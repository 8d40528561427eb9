// crates/reverie-server/src/manager/mod.rs
// Memory lifecycle: background indexing, forget/clear/delete, lazy load

mod rebuild;
mod reconcile;

pub use rebuild::RebuildReport;
pub use reconcile::ConsistencyReport;

use crate::config::MemoryConfig;
use crate::embeddings::EmbeddingCache;
use crate::error::{Result, ReverieError};
use crate::index::{
    Exclusions, IndexHandle, IndexRegistry, MemoryPoint, SearchHit, VectorBackend, VectorIndex,
};
use crate::retry::with_retry;
use crate::store::MessageStore;
use reverie_types::{
    ChatId, DeleteOutcome, IndexState, MemoryListing, MemoryStats, Message, MessageId, Role,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Owns every chat's index. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryManager {
    registry: Arc<IndexRegistry>,
    backend: Arc<dyn VectorBackend>,
    store: Arc<dyn MessageStore>,
    cache: Arc<EmbeddingCache>,
    config: Arc<MemoryConfig>,
    jobs: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl MemoryManager {
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        store: Arc<dyn MessageStore>,
        cache: Arc<EmbeddingCache>,
        config: MemoryConfig,
    ) -> Self {
        let permits = config.max_background_jobs.max(1);
        Self {
            registry: Arc::new(IndexRegistry::new()),
            backend,
            store,
            cache,
            config: Arc::new(config),
            jobs: Arc::new(Semaphore::new(permits)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    fn handle(&self, chat_id: ChatId) -> Result<Arc<IndexHandle>> {
        self.registry
            .get_or_create(chat_id)
            .ok_or_else(|| ReverieError::NotFound(format!("chat {chat_id} was deleted")))
    }

    fn empty_index(&self) -> VectorIndex {
        VectorIndex::new(self.cache.model_version(), self.cache.dimensions())
    }

    async fn store_call<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retry(&self.config.retry, self.config.store_timeout(), label, op).await
    }

    async fn embed_one(&self, content: &str) -> Result<Vec<f32>> {
        let cache = &self.cache;
        let model = cache.model_version();
        with_retry(
            &self.config.retry,
            self.config.embed_timeout(),
            "embed_message",
            move || async move {
                cache
                    .get_or_create(content, model)
                    .await
                    .map_err(ReverieError::from)
            },
        )
        .await
    }

    /// Cached exclusions for the handle, loaded from the backend on first use
    async fn exclusions(&self, handle: &IndexHandle) -> Result<Exclusions> {
        if let Some(ex) = &handle.read().await.exclusions {
            return Ok(ex.clone());
        }
        let chat_id = handle.chat_id();
        let backend = &self.backend;
        let loaded = self
            .store_call("load_exclusions", move || backend.load_exclusions(chat_id))
            .await?;
        Ok(handle.write().await.exclusions.get_or_insert(loaded).clone())
    }

    async fn save_exclusions(&self, handle: &IndexHandle, exclusions: Exclusions) -> Result<()> {
        let chat_id = handle.chat_id();
        let backend = &self.backend;
        let ex = &exclusions;
        self.store_call("save_exclusions", move || {
            backend.save_exclusions(chat_id, ex)
        })
        .await?;
        handle.write().await.exclusions = Some(exclusions);
        Ok(())
    }

    // ═══════════════════════════════════════
    // LIFECYCLE
    // ═══════════════════════════════════════

    /// Bring an untouched handle up (load or schedule a build) and retry a
    /// degraded one once its retry interval has passed.
    pub(crate) async fn ensure_ready(&self, handle: &Arc<IndexHandle>) {
        match handle.state().await {
            IndexState::Uninitialized => self.initialize(handle).await,
            IndexState::Degraded => {
                if !handle.retry_due(self.config.degraded_retry_after()).await {
                    return;
                }
                {
                    let mut inner = handle.write().await;
                    if inner.state != IndexState::Degraded {
                        return;
                    }
                    inner.state = IndexState::Rebuilding;
                }
                info!(chat_id = handle.chat_id(), "Retrying degraded memory index");
                self.spawn_rebuild(handle.clone());
            }
            _ => {}
        }
    }

    async fn initialize(&self, handle: &Arc<IndexHandle>) {
        let chat_id = handle.chat_id();
        {
            let writer = handle.lock_writer().await;
            if handle.is_retired() {
                return;
            }
            {
                let mut inner = handle.write().await;
                if inner.state != IndexState::Uninitialized {
                    return;
                }
                inner.state = IndexState::Loading;
            }

            let backend = &self.backend;
            let loaded = self
                .store_call("load_index", move || backend.load(chat_id))
                .await
                .and_then(|persisted| {
                    persisted
                        .map(|p| {
                            VectorIndex::from_persisted(
                                chat_id,
                                p,
                                self.cache.model_version(),
                                self.cache.dimensions(),
                            )
                        })
                        .transpose()
                });

            match loaded {
                Ok(Some(index)) => {
                    debug!(chat_id, points = index.len(), "Loaded memory index");
                    handle.write().await.set_ready(index);
                }
                Ok(None) => {
                    let store = &self.store;
                    let latest = self
                        .store_call("latest_message", move || store.latest_message_id(chat_id))
                        .await;
                    match latest {
                        Ok(None) => {
                            handle.write().await.set_ready(self.empty_index());
                            return;
                        }
                        Ok(Some(_)) => {
                            info!(chat_id, "No memory index yet, building in background");
                        }
                        Err(e) => {
                            warn!(chat_id, error = %e, "Transcript unreachable while loading index");
                        }
                    }
                    handle.write().await.state = IndexState::Rebuilding;
                    drop(writer);
                    self.spawn_rebuild(handle.clone());
                    return;
                }
                Err(e) => {
                    warn!(chat_id, error = %e, "Memory index unavailable, rebuilding");
                    handle.write().await.state = IndexState::Rebuilding;
                    drop(writer);
                    self.spawn_rebuild(handle.clone());
                    return;
                }
            }
        }
        self.spawn_reconcile(handle.clone());
    }

    /// Schedule embedding + upsert of a new message. Returns immediately.
    pub fn on_message_created(&self, message: Message) {
        if message.is_blank() {
            debug!(message_id = message.id, "Skipping blank message");
            return;
        }
        let Some(handle) = self.registry.get_or_create(message.chat_id) else {
            debug!(chat_id = message.chat_id, "Chat deleted, not indexing");
            return;
        };
        let this = self.clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = this.jobs.clone().acquire_owned().await else {
                return;
            };
            this.index_message(&handle, &message).await;
        });
    }

    async fn index_message(&self, handle: &Arc<IndexHandle>, message: &Message) {
        let chat_id = message.chat_id;
        self.ensure_ready(handle).await;

        let vector = match self.embed_one(&message.content).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    chat_id,
                    message_id = message.id,
                    error = %e,
                    "Embedding failed; message stays reachable through recency only"
                );
                return;
            }
        };

        let _writer = handle.lock_writer().await;
        if handle.is_retired() {
            return;
        }
        let exclusions = match self.exclusions(handle).await {
            Ok(ex) => ex,
            Err(e) => {
                warn!(chat_id, message_id = message.id, error = %e, "Could not read exclusions");
                return;
            }
        };
        if exclusions.excludes(message.id) {
            debug!(chat_id, message_id = message.id, "Message excluded from memory");
            return;
        }

        let point = MemoryPoint::from_message(message, vector);
        let manifest = {
            let inner = handle.read().await;
            match (&inner.state, &inner.index) {
                (IndexState::Ready, Some(index)) if index.dimension() == point.vector.len() => {
                    index.manifest_with(std::slice::from_ref(&point), &[])
                }
                (IndexState::Ready, Some(index)) => {
                    warn!(
                        chat_id,
                        expected = index.dimension(),
                        actual = point.vector.len(),
                        "Embedding dimension does not match index"
                    );
                    return;
                }
                (state, _) => {
                    debug!(chat_id, message_id = message.id, state = %state, "Index not ready, upsert left to rebuild");
                    return;
                }
            }
        };

        let backend = &self.backend;
        let points = std::slice::from_ref(&point);
        let m = &manifest;
        if let Err(e) = self
            .store_call("upsert_point", move || backend.upsert(chat_id, points, m))
            .await
        {
            warn!(chat_id, message_id = message.id, error = %e, "Failed to persist memory");
            return;
        }

        let mut inner = handle.write().await;
        if let Some(index) = inner.ready_index_mut()
            && let Err(e) = index.upsert(point)
        {
            warn!(chat_id, message_id = message.id, error = %e, "Failed to apply memory");
        }
        debug!(chat_id, message_id = message.id, "Indexed message");
    }

    fn spawn_rebuild(&self, handle: Arc<IndexHandle>) {
        let this = self.clone();
        let token = handle.cancel_token();
        self.tracker.spawn(async move {
            let Ok(_permit) = this.jobs.clone().acquire_owned().await else {
                return;
            };
            match this.run_rebuild(&handle, token, false).await {
                Ok(report) => info!(
                    chat_id = report.chat_id,
                    indexed = report.indexed,
                    failed = report.failed,
                    "Background rebuild finished"
                ),
                Err(ReverieError::Cancelled) => {
                    debug!(chat_id = handle.chat_id(), "Background rebuild cancelled")
                }
                Err(e) => warn!(chat_id = handle.chat_id(), error = %e, "Background rebuild failed"),
            }
        });
    }

    fn spawn_reconcile(&self, handle: Arc<IndexHandle>) {
        let this = self.clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = this.jobs.clone().acquire_owned().await else {
                return;
            };
            if let Err(e) = this.reconcile_handle(&handle).await {
                debug!(chat_id = handle.chat_id(), error = %e, "Post-load reconcile skipped");
            }
        });
    }

    // ═══════════════════════════════════════
    // MANAGEMENT OPERATIONS
    // ═══════════════════════════════════════

    /// Forget one memory. The message itself is untouched and will not be
    /// re-indexed by later jobs, rebuilds or reconciliation.
    pub async fn delete_memory(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<DeleteOutcome> {
        let Some(handle) = self.registry.get_or_create(chat_id) else {
            return Ok(DeleteOutcome::NotFound);
        };
        self.ensure_ready(&handle).await;
        let _writer = handle.lock_writer().await;

        let mut exclusions = self.exclusions(&handle).await?;
        if !exclusions.excludes(message_id) {
            exclusions.forgotten.insert(message_id);
            self.save_exclusions(&handle, exclusions).await?;
        }

        let (in_index, manifest) = {
            let inner = handle.read().await;
            match (&inner.state, &inner.index) {
                (IndexState::Ready, Some(index)) => (
                    index.contains(message_id),
                    Some(index.manifest_with(&[], &[message_id])),
                ),
                _ => (false, None),
            }
        };

        let backend = &self.backend;
        let ids = [message_id];
        let ids = &ids[..];
        let m = manifest.as_ref();
        let removed_rows = self
            .store_call("delete_point", move || backend.delete(chat_id, ids, m))
            .await?;

        if in_index && let Some(index) = handle.write().await.ready_index_mut() {
            index.remove(message_id);
        }

        let outcome = if in_index || removed_rows > 0 {
            DeleteOutcome::Removed
        } else {
            DeleteOutcome::NotFound
        };
        info!(chat_id, message_id, outcome = ?outcome, "Forgot memory");
        Ok(outcome)
    }

    /// Wipe every memory of the chat. Messages that exist now stay excluded
    /// from later rebuilds.
    pub async fn clear_all(&self, chat_id: ChatId) -> Result<()> {
        let Some(handle) = self.registry.get_or_create(chat_id) else {
            return Ok(());
        };
        handle.cancel_rebuilds();
        let _writer = handle.lock_writer().await;

        let mut exclusions = self.exclusions(&handle).await?;
        let store = &self.store;
        let watermark = match self
            .store_call("latest_message", move || store.latest_message_id(chat_id))
            .await
        {
            Ok(latest) => latest,
            Err(e) => {
                warn!(chat_id, error = %e, "Transcript unreachable, clearing up to indexed messages");
                let inner = handle.read().await;
                inner
                    .index
                    .as_ref()
                    .and_then(VectorIndex::max_message_id)
                    .max(exclusions.clear_watermark)
            }
        };
        if let Some(w) = watermark {
            exclusions.raise_watermark(w);
        }
        self.save_exclusions(&handle, exclusions).await?;

        let empty = self.empty_index();
        let backend = &self.backend;
        let manifest = empty.manifest();
        let m = &manifest;
        let no_points: Vec<MemoryPoint> = Vec::new();
        let no_points = &no_points[..];
        self.store_call("clear_index", move || {
            backend.replace(chat_id, no_points, m)
        })
        .await?;
        handle.write().await.set_ready(empty);
        info!(chat_id, watermark = ?watermark, "Cleared all memories");
        Ok(())
    }

    /// Management-surface name for [`clear_all`](Self::clear_all)
    pub async fn clear_memories(&self, chat_id: ChatId) -> Result<()> {
        self.clear_all(chat_id).await
    }

    /// Tear down the chat's index: cancel its jobs, drop every record and
    /// the exclusions. Later events for the chat are ignored.
    pub async fn delete_chat(&self, chat_id: ChatId) -> Result<()> {
        if let Some(handle) = self.registry.teardown(chat_id) {
            // wait out the current writer so nothing lands after the drop
            let _writer = handle.lock_writer().await;
            handle.write().await.index = None;
        }
        let backend = &self.backend;
        self.store_call("drop_namespace", move || backend.drop_namespace(chat_id))
            .await?;
        info!(chat_id, "Deleted chat memory");
        Ok(())
    }

    /// Re-embed the transcript and swap in the new index; the current index
    /// keeps serving searches until the swap.
    pub async fn rebuild(&self, chat_id: ChatId) -> Result<RebuildReport> {
        let handle = self.handle(chat_id)?;
        let token = handle.cancel_token();
        self.run_rebuild(&handle, token, false).await
    }

    /// Discard the index, then rebuild it from scratch
    pub async fn reindex(&self, chat_id: ChatId) -> Result<RebuildReport> {
        let handle = self.handle(chat_id)?;
        let token = handle.cancel_token();
        self.run_rebuild(&handle, token, true).await
    }

    // ═══════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════

    /// Search the chat's index. A degraded index answers with no hits; one
    /// still loading or rebuilding reports IndexUnavailable.
    pub async fn search(
        &self,
        chat_id: ChatId,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let handle = self
            .registry
            .get_or_create(chat_id)
            .ok_or_else(|| ReverieError::index_unavailable(chat_id, "chat deleted"))?;
        self.ensure_ready(&handle).await;
        handle
            .search(query, top_k)
            .await
            .map_err(|state| ReverieError::index_unavailable(chat_id, state.to_string()))
    }

    /// Indexed memories in chronological order
    pub async fn list_memories(&self, chat_id: ChatId) -> Result<Vec<MemoryListing>> {
        let Some(handle) = self.registry.get_or_create(chat_id) else {
            return Ok(Vec::new());
        };
        self.ensure_ready(&handle).await;
        {
            let inner = handle.read().await;
            if let (IndexState::Ready, Some(index)) = (&inner.state, &inner.index) {
                return Ok(index.listings());
            }
        }

        // Not ready: report what is persisted, minus anything excluded
        let exclusions = self.exclusions(&handle).await?;
        let backend = &self.backend;
        let mut points = self
            .store_call("load_points", move || backend.load_points(chat_id))
            .await?;
        points.retain(|p| !exclusions.excludes(p.message_id));
        points.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.message_id.cmp(&b.message_id))
        });
        Ok(points.iter().map(MemoryPoint::listing).collect())
    }

    pub async fn stats(&self, chat_id: ChatId) -> Result<MemoryStats> {
        let handle = self.handle(chat_id)?;
        self.ensure_ready(&handle).await;
        let inner = handle.read().await;
        let mut stats = MemoryStats {
            chat_id,
            state: inner.state,
            total_vectors: 0,
            user_messages: 0,
            assistant_messages: 0,
            model_version: None,
            dimensions: None,
        };
        if let Some(index) = &inner.index {
            stats.total_vectors = index.len();
            stats.model_version = Some(index.model_version().to_string());
            stats.dimensions = Some(index.dimension());
            for p in index.points() {
                match p.role {
                    Role::User => stats.user_messages += 1,
                    Role::Assistant => stats.assistant_messages += 1,
                    Role::System => {}
                }
            }
        }
        Ok(stats)
    }

    pub async fn state(&self, chat_id: ChatId) -> Option<IndexState> {
        match self.registry.get(chat_id) {
            Some(handle) => Some(handle.state().await),
            None => None,
        }
    }

    // ═══════════════════════════════════════
    // BACKGROUND WORK
    // ═══════════════════════════════════════

    /// Wait until every scheduled job (indexing, rebuilds, reconciles) is done,
    /// including jobs those jobs schedule.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel rebuilds and wait for in-flight jobs
    pub async fn shutdown(&self) {
        for handle in self.registry.handles() {
            handle.cancel_rebuilds();
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("Memory manager stopped");
    }
}
