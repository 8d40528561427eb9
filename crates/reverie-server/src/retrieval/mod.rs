// crates/reverie-server/src/retrieval/mod.rs
// Per-turn context retrieval: lore, relevant memories, recency window

mod context;

pub use context::{
    Budget, Diagnostics, Fragment, FragmentKind, Placeholders, RENDER_MAX_CHARS, RetrievalContext,
    assemble,
};

use crate::error::{Result, ReverieError};
use crate::lore::LorebookMatcher;
use crate::manager::MemoryManager;
use reverie_types::{CharacterId, ChatId, LorebookEntry, Message};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// One generation turn's retrieval request
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub chat_id: ChatId,
    pub query_text: String,
    pub character_id: CharacterId,
    pub user_name: Option<String>,
    pub char_name: Option<String>,
}

impl ContextRequest {
    pub fn new(chat_id: ChatId, character_id: CharacterId, query_text: impl Into<String>) -> Self {
        Self {
            chat_id,
            query_text: query_text.into(),
            character_id,
            ..Default::default()
        }
    }

    pub fn with_names(mut self, user_name: Option<String>, char_name: Option<String>) -> Self {
        self.user_name = user_name;
        self.char_name = char_name;
        self
    }
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(ReverieError::Timeout(limit)),
    }
}

/// Builds the context for each turn. Never fails: a source that errors or
/// times out is left empty and reported in the diagnostics.
#[derive(Clone)]
pub struct Retriever {
    manager: MemoryManager,
    lore: LorebookMatcher,
}

impl Retriever {
    pub fn new(manager: MemoryManager, lore: LorebookMatcher) -> Self {
        Self { manager, lore }
    }

    pub fn manager(&self) -> &MemoryManager {
        &self.manager
    }

    pub async fn get_context(&self, request: &ContextRequest) -> RetrievalContext {
        let config = self.manager.config();
        let (relevant, recent, lore) = tokio::join!(
            bounded(
                config.embed_timeout() + config.store_timeout(),
                self.relevant(request),
            ),
            bounded(config.store_timeout(), self.recent(request.chat_id)),
            bounded(
                config.store_timeout(),
                self.lore.match_entries(
                    &request.query_text,
                    request.character_id,
                    config.max_lore_entries,
                ),
            ),
        );

        let mut diagnostics = Diagnostics::default();
        let relevant = relevant.unwrap_or_else(|e| {
            diagnostics.relevance = Some(e.to_string());
            Vec::new()
        });
        let recent = recent.unwrap_or_else(|e| {
            warn!(chat_id = request.chat_id, error = %e, "Recency window unavailable");
            diagnostics.recency = Some(e.to_string());
            Vec::new()
        });
        let lore: Vec<LorebookEntry> = lore.unwrap_or_else(|e| {
            warn!(character_id = request.character_id, error = %e, "Lorebook unavailable");
            diagnostics.lore = Some(e.to_string());
            Vec::new()
        });

        let names = Placeholders {
            user_name: request.user_name.as_deref(),
            char_name: request.char_name.as_deref(),
        };
        let context = assemble(
            request.chat_id,
            &lore,
            &relevant,
            &recent,
            config,
            names,
            diagnostics,
        );
        debug!(
            chat_id = request.chat_id,
            lore = context.lore().count(),
            memories = context.memories().count(),
            recent = context.recent().count(),
            used = context.budget.used,
            dropped = context.diagnostics.dropped,
            degraded = context.diagnostics.is_degraded(),
            "Context assembled"
        );
        context
    }

    /// Relevant past messages, best first
    async fn relevant(&self, request: &ContextRequest) -> Result<Vec<(Message, f32)>> {
        if request.query_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let config = self.manager.config();
        let cache = self.manager.cache();
        let query = cache
            .get_or_create(&request.query_text, cache.model_version())
            .await?;
        let hits = self
            .manager
            .search(request.chat_id, &query, config.top_k)
            .await?;
        if hits.is_empty()
            && let Some(state) = self.manager.state(request.chat_id).await
            && !state.is_searchable()
        {
            return Err(ReverieError::index_unavailable(request.chat_id, state.to_string()));
        }

        let store = self.manager.store();
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits
            .into_iter()
            .filter(|h| h.score >= config.similarity_threshold)
        {
            // The index may briefly trail a deletion
            match store.get_message(hit.message_id).await? {
                Some(m) if m.chat_id == request.chat_id => out.push((m, hit.score)),
                _ => debug!(message_id = hit.message_id, "Search hit without a message"),
            }
        }
        Ok(out)
    }

    /// Last N non-blank messages, oldest first
    async fn recent(&self, chat_id: ChatId) -> Result<Vec<Message>> {
        let window = self.manager.config().recency_window;
        if window == 0 {
            return Ok(Vec::new());
        }
        let messages = self.manager.store().recent_messages(chat_id, window).await?;
        Ok(messages.into_iter().filter(|m| !m.is_blank()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryConfig, RetryConfig, Truncation};
    use crate::embeddings::{EmbeddingCache, ProviderError};
    use crate::lore::StaticLorebook;
    use crate::testing::{InMemoryMessageStore, InMemoryVectorBackend, ScriptedEmbedder};
    use reverie_types::{LorebookEntry, Provenance, Role};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const CHAT: ChatId = 1;
    const CHARACTER: CharacterId = 7;

    struct Fixture {
        retriever: Retriever,
        store: Arc<InMemoryMessageStore>,
        embedder: Arc<ScriptedEmbedder>,
    }

    fn fixture(config: MemoryConfig, lore: Vec<LorebookEntry>) -> Fixture {
        let store = Arc::new(InMemoryMessageStore::new());
        let embedder = Arc::new(ScriptedEmbedder::new());
        let cache = Arc::new(EmbeddingCache::new(
            embedder.clone(),
            config.cache_capacity,
            config.embed_timeout(),
        ));
        let manager = MemoryManager::new(
            Arc::new(InMemoryVectorBackend::new()),
            store.clone(),
            cache,
            config,
        );
        let matcher = LorebookMatcher::new(Arc::new(StaticLorebook::new(lore)));
        Fixture {
            retriever: Retriever::new(manager, matcher),
            store,
            embedder,
        }
    }

    fn fast_config() -> MemoryConfig {
        MemoryConfig {
            similarity_threshold: 0.5,
            retry: RetryConfig {
                max_retries: 0,
                initial_delay_ms: 1,
                max_delay_ms: 1,
                backoff_multiplier: 1.0,
            },
            degraded_retry_after_secs: 3600,
            ..MemoryConfig::default()
        }
    }

    impl Fixture {
        async fn say(&self, role: Role, content: &str) -> Message {
            let m = self.store.push(CHAT, role, content);
            self.retriever.manager().on_message_created(m.clone());
            self.retriever.manager().wait_idle().await;
            m
        }

        async fn context(&self, query: &str) -> RetrievalContext {
            self.retriever
                .get_context(&ContextRequest::new(CHAT, CHARACTER, query))
                .await
        }
    }

    // ═══════════════════════════════════════
    // SOURCES
    // ═══════════════════════════════════════

    #[tokio::test]
    async fn test_relevant_memory_found_beyond_recency_window() {
        let mut config = fast_config();
        config.recency_window = 2;
        let f = fixture(config, vec![]);
        let dragon = f.say(Role::User, "My dragon is named Ember").await;
        f.say(Role::Assistant, "What a fine name").await;
        f.say(Role::User, "The rain will not stop").await;
        f.say(Role::Assistant, "Then stay by the tavern fire").await;

        let ctx = f.context("Tell me about my dragon").await;
        assert!(!ctx.diagnostics.is_degraded(), "{:?}", ctx.diagnostics);
        assert_eq!(ctx.memory_ids().first(), Some(&dragon.id));
        assert_eq!(ctx.recent().count(), 2);
    }

    #[tokio::test]
    async fn test_embedder_failure_keeps_recency_floor() {
        let f = fixture(fast_config(), vec![]);
        for i in 0..3 {
            f.store.push(CHAT, Role::User, &format!("line {i}"));
        }
        f.embedder
            .fail_with(Some(ProviderError::Network("connection refused".into())));

        let ctx = f.context("anything about dragons").await;
        assert!(ctx.diagnostics.relevance.is_some());
        assert_eq!(ctx.memories().count(), 0);
        assert_eq!(ctx.recent().count(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_store_yields_lore_only() {
        let lore = vec![LorebookEntry::from_keys(
            1,
            CHARACTER,
            "capital",
            "The Capital is a walled city.",
            0,
        )];
        let f = fixture(fast_config(), lore);
        f.store.set_unreachable(true);

        let ctx = f.context("we ride to the capital").await;
        assert!(ctx.diagnostics.recency.is_some());
        assert_eq!(ctx.lore().count(), 1);
        assert!(ctx.recent().next().is_none());
    }

    #[tokio::test]
    async fn test_lore_matches_keyword_and_substitutes_names() {
        let lore = vec![
            LorebookEntry::from_keys(1, CHARACTER, "capital", "{{char}} was born in the Capital.", 0),
            LorebookEntry::from_keys(2, CHARACTER, "harbor", "The harbor freezes in winter.", 0),
            LorebookEntry::from_keys(3, 99, "capital", "Another character's lore.", 0),
        ];
        let f = fixture(fast_config(), lore);
        let request = ContextRequest::new(CHAT, CHARACTER, "Let's travel to the capital")
            .with_names(Some("Ada".into()), Some("Oak".into()));
        let ctx = f.retriever.get_context(&request).await;

        let texts: Vec<&str> = ctx.lore().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["Oak was born in the Capital."]);
    }

    #[tokio::test]
    async fn test_message_in_window_and_relevant_tagged_twice() {
        let f = fixture(fast_config(), vec![]);
        let m = f.say(Role::User, "The dragon sleeps under the mountain").await;

        let ctx = f.context("where does the dragon sleep?").await;
        assert_eq!(ctx.memory_ids(), vec![m.id]);
        assert!(ctx.recent_ids().is_empty());
        let fragment = ctx.memories().next().unwrap();
        assert_eq!(
            fragment.provenance,
            BTreeSet::from([Provenance::Relevance, Provenance::Recency])
        );
    }

    #[tokio::test]
    async fn test_blank_query_skips_relevance() {
        let f = fixture(fast_config(), vec![]);
        f.say(Role::User, "dragons everywhere").await;
        let before = f.embedder.calls();

        let ctx = f.context("   ").await;
        assert_eq!(f.embedder.calls(), before);
        assert_eq!(ctx.memories().count(), 0);
        assert_eq!(ctx.recent().count(), 1);
    }

    #[tokio::test]
    async fn test_budget_partial_truncation() {
        let mut config = fast_config();
        config.context_budget = 30;
        config.truncation = Truncation::Partial;
        config.recency_window = 3;
        let f = fixture(config, vec![]);
        f.store.push(CHAT, Role::User, "0123456789abcdefghij");
        f.store.push(CHAT, Role::User, "klmnopqrstuvwxyz0123");

        let ctx = f.context("   ").await;
        assert_eq!(ctx.budget.used, 30);
        let oldest = ctx.recent().next().unwrap();
        assert!(oldest.truncated);
        assert_eq!(oldest.text, "0123456789");
    }
}
