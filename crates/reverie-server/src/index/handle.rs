// crates/reverie-server/src/index/handle.rs
// Per-chat index handle: lifecycle state, the live index, writer serialization

use super::{Exclusions, SearchHit, VectorIndex};
use reverie_types::{ChatId, IndexState};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// State guarded by the handle's read/write lock
#[derive(Debug)]
pub struct HandleInner {
    pub state: IndexState,
    pub index: Option<VectorIndex>,
    /// Loaded lazily from the backend on first mutation
    pub exclusions: Option<Exclusions>,
    pub degraded_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl HandleInner {
    /// Ready iff an index is present
    pub fn set_ready(&mut self, index: VectorIndex) {
        self.index = Some(index);
        self.state = IndexState::Ready;
        self.degraded_at = None;
        self.last_error = None;
    }

    pub fn set_degraded(&mut self, reason: impl Into<String>) {
        self.index = None;
        self.state = IndexState::Degraded;
        self.degraded_at = Some(Instant::now());
        self.last_error = Some(reason.into());
    }

    /// Mutable index, only when Ready
    pub fn ready_index_mut(&mut self) -> Option<&mut VectorIndex> {
        if self.state == IndexState::Ready {
            self.index.as_mut()
        } else {
            None
        }
    }
}

/// One chat's vector index.
///
/// Readers take the `inner` read lock and see either the pre- or post-mutation
/// index. Every mutation (upsert, delete, clear, rebuild) first takes the
/// `writer` mutex, so there is one writer per chat at a time.
pub struct IndexHandle {
    chat_id: ChatId,
    inner: RwLock<HandleInner>,
    writer: Mutex<()>,
    cancel: StdMutex<CancellationToken>,
    retired: AtomicBool,
}

impl IndexHandle {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            inner: RwLock::new(HandleInner {
                state: IndexState::Uninitialized,
                index: None,
                exclusions: None,
                degraded_at: None,
                last_error: None,
            }),
            writer: Mutex::new(()),
            cancel: StdMutex::new(CancellationToken::new()),
            retired: AtomicBool::new(false),
        }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub async fn state(&self) -> IndexState {
        self.inner.read().await.state
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, HandleInner> {
        self.inner.read().await
    }

    /// Write access to the state. Callers mutating the index must hold the
    /// writer lock as well.
    pub async fn write(&self) -> RwLockWriteGuard<'_, HandleInner> {
        self.inner.write().await
    }

    pub async fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    /// Search the live index. Degraded answers with no hits; any other state
    /// short of Ready comes back as the error.
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> std::result::Result<Vec<SearchHit>, IndexState> {
        let inner = self.inner.read().await;
        match (inner.state, &inner.index) {
            (IndexState::Ready, Some(index)) => Ok(index.search(query, top_k)),
            (IndexState::Degraded, _) => Ok(Vec::new()),
            (state, _) => Err(state),
        }
    }

    /// Token for the current generation of background work
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel in-flight rebuilds; later work gets a fresh token.
    pub fn cancel_rebuilds(&self) {
        let mut token = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Permanently retire the handle (chat deleted)
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Degraded long enough that a rebuild should be attempted again
    pub async fn retry_due(&self, after: Duration) -> bool {
        let inner = self.inner.read().await;
        inner.state == IndexState::Degraded
            && inner.degraded_at.is_none_or(|at| at.elapsed() >= after)
    }
}
