// crates/reverie-server/src/manager/rebuild.rs
// Full index rebuild from the transcript

use super::MemoryManager;
use crate::error::{Result, ReverieError};
use crate::index::{IndexHandle, MemoryPoint, VectorIndex};
use crate::retry::with_retry;
use reverie_types::{ChatId, IndexState, Message};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of a rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub chat_id: ChatId,
    /// Messages eligible for indexing
    pub candidates: usize,
    pub indexed: usize,
    pub failed: usize,
    /// Forgotten or cleared messages left out
    pub excluded: usize,
    pub skipped_blank: usize,
}

impl MemoryManager {
    /// Rebuild under the writer lock.
    ///
    /// A Ready index keeps serving until the swap unless `discard_first`.
    /// Cancellation never marks the handle Ready.
    pub(crate) async fn run_rebuild(
        &self,
        handle: &IndexHandle,
        token: CancellationToken,
        discard_first: bool,
    ) -> Result<RebuildReport> {
        let chat_id = handle.chat_id();
        let _writer = handle.lock_writer().await;
        if token.is_cancelled() || handle.is_retired() {
            return Err(ReverieError::Cancelled);
        }

        let serving = {
            let mut inner = handle.write().await;
            if discard_first || inner.state != IndexState::Ready {
                inner.index = None;
                inner.state = IndexState::Rebuilding;
                false
            } else {
                true
            }
        };
        info!(chat_id, discard_first, "Rebuilding memory index");

        let outcome = self.build_index(handle, &token).await;
        let mut inner = handle.write().await;
        match outcome {
            Ok((index, report)) => {
                inner.set_ready(index);
                Ok(report)
            }
            Err(ReverieError::Cancelled) => {
                if !serving && !handle.is_retired() {
                    inner.set_degraded("rebuild cancelled");
                }
                Err(ReverieError::Cancelled)
            }
            Err(e) if serving => {
                warn!(chat_id, error = %e, "Rebuild failed; keeping the current index");
                Err(e)
            }
            Err(e) => {
                warn!(chat_id, error = %e, "Rebuild failed; memory degraded to recency");
                inner.set_degraded(e.to_string());
                Err(e)
            }
        }
    }

    /// Embed every eligible message and persist the result as one swap
    async fn build_index(
        &self,
        handle: &IndexHandle,
        token: &CancellationToken,
    ) -> Result<(VectorIndex, RebuildReport)> {
        let chat_id = handle.chat_id();
        let exclusions = self.exclusions(handle).await?;
        let store = &self.store;
        let messages = self
            .store_call("load_transcript", move || store.get_messages(chat_id, None))
            .await?;

        let mut report = RebuildReport {
            chat_id,
            ..Default::default()
        };
        let mut candidates: Vec<Message> = Vec::with_capacity(messages.len());
        for m in messages {
            if m.is_blank() {
                report.skipped_blank += 1;
            } else if exclusions.excludes(m.id) {
                report.excluded += 1;
            } else {
                candidates.push(m);
            }
        }
        report.candidates = candidates.len();

        let cache = &self.cache;
        let model = cache.model_version();
        let mut index = self.empty_index();
        let mut points = Vec::with_capacity(candidates.len());

        for batch in candidates.chunks(self.config.rebuild_batch_size.max(1)) {
            if token.is_cancelled() {
                return Err(ReverieError::Cancelled);
            }
            let texts: Vec<String> = batch.iter().map(|m| m.content.clone()).collect();
            let texts = &texts[..];
            let embedded = tokio::select! {
                _ = token.cancelled() => return Err(ReverieError::Cancelled),
                r = with_retry(
                    &self.config.retry,
                    self.config.embed_timeout(),
                    "rebuild_embed",
                    move || async move {
                        cache
                            .get_or_create_batch(texts, model)
                            .await
                            .map_err(ReverieError::from)
                    },
                ) => r,
            };
            match embedded {
                Ok(vectors) => {
                    for (message, vector) in batch.iter().zip(vectors) {
                        let point = MemoryPoint::from_message(message, vector);
                        index.upsert(point.clone())?;
                        points.push(point);
                        report.indexed += 1;
                    }
                }
                Err(e) => {
                    warn!(chat_id, batch = batch.len(), error = %e, "Rebuild batch failed");
                    report.failed += batch.len();
                }
            }
        }

        if report.candidates > 0 && report.indexed == 0 {
            return Err(ReverieError::index_unavailable(
                chat_id,
                "no message could be embedded",
            ));
        }
        if token.is_cancelled() {
            return Err(ReverieError::Cancelled);
        }

        let backend = &self.backend;
        let manifest = index.manifest();
        let m = &manifest;
        let p = &points[..];
        self.store_call("replace_index", move || backend.replace(chat_id, p, m))
            .await?;
        Ok((index, report))
    }
}
