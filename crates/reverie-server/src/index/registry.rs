// crates/reverie-server/src/index/registry.rs
// Keyed registry of per-chat index handles

use super::IndexHandle;
use lru::LruCache;
use reverie_types::ChatId;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

/// Deleted chat ids remembered so stragglers cannot recreate their handles
const RETIRED_CAPACITY: usize = 4096;

struct RegistryInner {
    handles: HashMap<ChatId, Arc<IndexHandle>>,
    /// Most recently deleted chats
    retired: LruCache<ChatId, ()>,
}

/// Create-on-first-use map of chat id to handle, with teardown on chat delete.
pub struct IndexRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for IndexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::with_retired_capacity(RETIRED_CAPACITY)
    }

    pub fn with_retired_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(RegistryInner {
                handles: HashMap::new(),
                retired: LruCache::new(capacity),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle for `chat_id`, created if missing. None once the chat is deleted.
    pub fn get_or_create(&self, chat_id: ChatId) -> Option<Arc<IndexHandle>> {
        let mut inner = self.lock();
        if inner.retired.contains(&chat_id) {
            return None;
        }
        Some(
            inner
                .handles
                .entry(chat_id)
                .or_insert_with(|| Arc::new(IndexHandle::new(chat_id)))
                .clone(),
        )
    }

    pub fn get(&self, chat_id: ChatId) -> Option<Arc<IndexHandle>> {
        self.lock().handles.get(&chat_id).cloned()
    }

    /// Remove and retire the handle; later lookups return None.
    pub fn teardown(&self, chat_id: ChatId) -> Option<Arc<IndexHandle>> {
        let mut inner = self.lock();
        inner.retired.put(chat_id, ());
        let handle = inner.handles.remove(&chat_id);
        if let Some(h) = &handle {
            h.retire();
        }
        handle
    }

    pub fn is_retired(&self, chat_id: ChatId) -> bool {
        self.lock().retired.contains(&chat_id)
    }

    pub fn retired_len(&self) -> usize {
        self.lock().retired.len()
    }

    pub fn chat_ids(&self) -> Vec<ChatId> {
        let mut ids: Vec<ChatId> = self.lock().handles.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn handles(&self) -> Vec<Arc<IndexHandle>> {
        self.lock().handles.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_on_first_use_returns_same_handle() {
        let registry = IndexRegistry::new();
        let a = registry.get_or_create(1).unwrap();
        let b = registry.get_or_create(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.chat_ids(), vec![1]);
    }

    #[test]
    fn test_teardown_retires_chat() {
        let registry = IndexRegistry::new();
        let handle = registry.get_or_create(2).unwrap();
        let removed = registry.teardown(2).unwrap();
        assert!(Arc::ptr_eq(&handle, &removed));
        assert!(handle.is_retired());
        assert!(registry.get_or_create(2).is_none());
        assert!(registry.is_retired(2));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_teardown_unknown_chat_still_retires() {
        let registry = IndexRegistry::new();
        assert!(registry.teardown(3).is_none());
        assert!(registry.get_or_create(3).is_none());
    }

    #[test]
    fn test_retired_ids_are_bounded() {
        let registry = IndexRegistry::with_retired_capacity(2);
        for chat_id in 1..=5 {
            let _ = registry.get_or_create(chat_id);
            registry.teardown(chat_id);
        }
        assert_eq!(registry.retired_len(), 2);
        assert!(registry.is_retired(5));
        assert!(registry.is_retired(4));
        assert!(!registry.is_retired(1));
        assert!(registry.is_empty());
    }
}
