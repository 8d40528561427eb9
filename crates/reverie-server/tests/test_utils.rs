//! Test utilities for Reverie integration tests
//!
//! Builds the full engine over a pooled SQLite database with the scripted
//! embedder standing in for the network provider.

#![allow(dead_code)]

use reverie::config::{MemoryConfig, RetryConfig};
use reverie::db::DatabasePool;
use reverie::embeddings::EmbeddingCache;
use reverie::index::SqliteVectorBackend;
use reverie::lore::{LorebookMatcher, SqliteLorebookSource};
use reverie::manager::MemoryManager;
use reverie::retrieval::{ContextRequest, RetrievalContext, Retriever};
use reverie::store::SqliteMessageStore;
use reverie::testing::ScriptedEmbedder;
use reverie_types::{CharacterId, ChatId, Message, Role};
use std::path::Path;
use std::sync::Arc;

pub const CHARACTER: CharacterId = 7;

/// Retries off and short timeouts so failure paths finish quickly
pub fn test_config() -> MemoryConfig {
    MemoryConfig {
        retry: RetryConfig {
            max_retries: 1,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        },
        embed_timeout_secs: 5,
        store_timeout_secs: 5,
        degraded_retry_after_secs: 0,
        ..MemoryConfig::default()
    }
}

/// Engine wired over one database
pub struct TestEngine {
    pub pool: Arc<DatabasePool>,
    pub store: Arc<SqliteMessageStore>,
    pub lore: Arc<SqliteLorebookSource>,
    pub embedder: Arc<ScriptedEmbedder>,
    pub manager: MemoryManager,
    pub retriever: Retriever,
}

impl TestEngine {
    /// Create a new engine with an in-memory database
    pub async fn new() -> Self {
        let pool = Arc::new(
            DatabasePool::open_in_memory()
                .await
                .expect("Failed to create in-memory pool"),
        );
        Self::over(pool, ScriptedEmbedder::new(), test_config())
    }

    /// Engine over a database file, as a fresh process would open it
    pub async fn open_file(path: &Path, embedder: ScriptedEmbedder) -> Self {
        let pool = Arc::new(
            DatabasePool::open(path)
                .await
                .expect("Failed to open database file"),
        );
        Self::over(pool, embedder, test_config())
    }

    pub fn over(pool: Arc<DatabasePool>, embedder: ScriptedEmbedder, config: MemoryConfig) -> Self {
        let embedder = Arc::new(embedder);
        let store = Arc::new(SqliteMessageStore::new(pool.clone()));
        let lore = Arc::new(SqliteLorebookSource::new(pool.clone()));
        let cache = Arc::new(EmbeddingCache::new(
            embedder.clone(),
            config.cache_capacity,
            config.embed_timeout(),
        ));
        let manager = MemoryManager::new(
            Arc::new(SqliteVectorBackend::new(pool.clone())),
            store.clone(),
            cache,
            config,
        );
        let retriever = Retriever::new(manager.clone(), LorebookMatcher::new(lore.clone()));
        Self {
            pool,
            store,
            lore,
            embedder,
            manager,
            retriever,
        }
    }

    /// Same database, new process state (registry, cache, embedder)
    pub fn restart(&self, embedder: ScriptedEmbedder) -> Self {
        Self::over(self.pool.clone(), embedder, test_config())
    }

    pub async fn new_chat(&self) -> ChatId {
        self.store
            .create_chat(CHARACTER, Some("test chat".into()))
            .await
            .expect("create chat")
    }

    /// Append a message and wait for it to be indexed
    pub async fn say(&self, chat_id: ChatId, role: Role, content: &str) -> Message {
        let message = self
            .store
            .insert_message(chat_id, role, content)
            .await
            .expect("insert message");
        self.manager.on_message_created(message.clone());
        self.manager.wait_idle().await;
        message
    }

    pub async fn context(&self, chat_id: ChatId, query: &str) -> RetrievalContext {
        self.retriever
            .get_context(&ContextRequest::new(chat_id, CHARACTER, query))
            .await
    }

    pub async fn listed_ids(&self, chat_id: ChatId) -> Vec<i64> {
        self.manager
            .list_memories(chat_id)
            .await
            .expect("list memories")
            .into_iter()
            .map(|m| m.message_id)
            .collect()
    }
}

/// Ten turns where only the third mentions dragons
pub const TEN_TURNS: [&str; 10] = [
    "Good morning, traveler",
    "Good morning to you as well",
    "Dragons scare me",
    "Have you eaten yet?",
    "Some stew at the tavern",
    "The rain is heavy today",
    "We should wait for the storm to pass",
    "My sword needs sharpening",
    "The blacksmith is near the harbor",
    "Then let us go",
];
