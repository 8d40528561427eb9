// crates/reverie-server/src/manager/reconcile.rs
// Repair drift between the index and the transcript

use super::MemoryManager;
use crate::error::{Result, ReverieError};
use crate::index::{IndexHandle, MemoryPoint};
use crate::retry::with_retry;
use reverie_types::{ChatId, IndexState, Message, MessageId};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// What a reconciliation pass found and fixed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub chat_id: ChatId,
    /// Indexable messages without a record
    pub missing: usize,
    /// Records whose message is gone or excluded
    pub orphaned: usize,
    pub reembedded: usize,
    pub dropped: usize,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing == 0 && self.orphaned == 0
    }
}

impl MemoryManager {
    /// Re-embed missing records and drop orphaned ones. Never touches messages.
    pub async fn reconcile(&self, chat_id: ChatId) -> Result<ConsistencyReport> {
        let handle = self.handle(chat_id)?;
        self.ensure_ready(&handle).await;
        self.reconcile_handle(&handle).await
    }

    /// Reconcile every chat with a persisted or live index; failures are logged
    pub async fn reconcile_all(&self) -> Vec<ConsistencyReport> {
        let backend = &self.backend;
        let mut chat_ids: BTreeSet<ChatId> = match self
            .store_call("list_namespaces", move || backend.namespaces())
            .await
        {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Could not list memory namespaces");
                BTreeSet::new()
            }
        };
        chat_ids.extend(self.registry.chat_ids());

        let mut reports = Vec::new();
        for chat_id in chat_ids {
            if self.registry.is_retired(chat_id) {
                continue;
            }
            match self.reconcile(chat_id).await {
                Ok(report) => reports.push(report),
                Err(e) => debug!(chat_id, error = %e, "Reconcile skipped"),
            }
        }
        reports
    }

    pub(crate) async fn reconcile_handle(&self, handle: &IndexHandle) -> Result<ConsistencyReport> {
        let chat_id = handle.chat_id();
        let _writer = handle.lock_writer().await;
        if handle.is_retired() {
            return Err(ReverieError::Cancelled);
        }
        let state = handle.state().await;
        if state != IndexState::Ready {
            return Err(ReverieError::index_unavailable(chat_id, state.to_string()));
        }

        let exclusions = self.exclusions(handle).await?;
        let store = &self.store;
        let messages = self
            .store_call("load_transcript", move || store.get_messages(chat_id, None))
            .await?;
        let expected: HashMap<MessageId, Message> = messages
            .into_iter()
            .filter(|m| !m.is_blank() && !exclusions.excludes(m.id))
            .map(|m| (m.id, m))
            .collect();

        let (mut next, missing, orphaned) = {
            let inner = handle.read().await;
            let Some(index) = inner.index.as_ref() else {
                return Err(ReverieError::index_unavailable(chat_id, "no index"));
            };
            let orphaned: Vec<MessageId> =
                index.ids().filter(|id| !expected.contains_key(id)).collect();
            let mut missing: Vec<&Message> = expected
                .values()
                .filter(|m| !index.contains(m.id))
                .collect();
            missing.sort_by_key(|m| m.id);
            (index.clone(), missing, orphaned)
        };

        let mut report = ConsistencyReport {
            chat_id,
            missing: missing.len(),
            orphaned: orphaned.len(),
            ..Default::default()
        };
        if report.is_consistent() {
            debug!(chat_id, "Memory index consistent");
            return Ok(report);
        }
        warn!(
            chat_id,
            missing = report.missing,
            orphaned = report.orphaned,
            "{}",
            ReverieError::ConsistencyViolation {
                chat_id,
                detail: "index and transcript diverged".to_string(),
            }
        );

        for id in &orphaned {
            if next.remove(*id) {
                report.dropped += 1;
            }
        }

        if !missing.is_empty() {
            let cache = &self.cache;
            let model = cache.model_version();
            let texts: Vec<String> = missing.iter().map(|m| m.content.clone()).collect();
            let texts = &texts[..];
            let embedded = with_retry(
                &self.config.retry,
                self.config.embed_timeout(),
                "reconcile_embed",
                move || async move {
                    cache
                        .get_or_create_batch(texts, model)
                        .await
                        .map_err(ReverieError::from)
                },
            )
            .await;
            match embedded {
                Ok(vectors) => {
                    for (message, vector) in missing.iter().zip(vectors) {
                        next.upsert(MemoryPoint::from_message(message, vector))?;
                        report.reembedded += 1;
                    }
                }
                Err(e) => warn!(chat_id, error = %e, "Could not re-embed missing memories"),
            }
        }

        if report.dropped == 0 && report.reembedded == 0 {
            return Ok(report);
        }

        let backend = &self.backend;
        let points: Vec<MemoryPoint> = next.points().cloned().collect();
        let manifest = next.manifest();
        let p = &points[..];
        let m = &manifest;
        self.store_call("replace_index", move || backend.replace(chat_id, p, m))
            .await?;
        handle.write().await.set_ready(next);
        info!(
            chat_id,
            reembedded = report.reembedded,
            dropped = report.dropped,
            "Reconciled memory index"
        );
        Ok(report)
    }
}
