// crates/reverie-server/src/cli/app.rs
// Wire config, storage and providers into a running engine

use super::Cli;
use anyhow::{Context, Result, bail};
use reverie::config::{EnvConfig, ReverieConfig};
use reverie::db::DatabasePool;
use reverie::embeddings::{EmbeddingCache, build_provider};
use reverie::http::create_shared_client;
use reverie::index::SqliteVectorBackend;
use reverie::lore::{LorebookMatcher, SqliteLorebookSource};
use reverie::manager::MemoryManager;
use reverie::retrieval::Retriever;
use reverie::store::SqliteMessageStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct App {
    pub store: Arc<SqliteMessageStore>,
    pub lore: Arc<SqliteLorebookSource>,
    pub manager: MemoryManager,
    pub retriever: Retriever,
}

/// Database path: --db, then REVERIE_DB, then config.toml, then ~/.reverie/reverie.db
fn resolve_db_path(cli: &Cli, env: &EnvConfig, file: &ReverieConfig) -> PathBuf {
    cli.db
        .clone()
        .or_else(|| env.db_path.clone())
        .or_else(|| file.storage.db_path.clone())
        .unwrap_or_else(|| ReverieConfig::home_dir().join("reverie.db"))
}

impl App {
    pub async fn open(cli: &Cli) -> Result<Self> {
        let file = ReverieConfig::load();
        let env = EnvConfig::load();

        let mut memory = file.memory.clone();
        memory.apply_overrides(|name| std::env::var(name).ok());

        let mut validation = memory.validate();
        validation.merge(env.validate());
        if !validation.is_valid() {
            bail!("invalid configuration\n{}", validation.report());
        }
        for warning in &validation.warnings {
            tracing::warn!("{}", warning);
        }

        let mut embeddings = env.embeddings.clone();
        if embeddings.model.is_none() {
            embeddings.model = file.embeddings.model.clone();
        }
        if embeddings.dimensions.is_none() {
            embeddings.dimensions = file.embeddings.dimensions;
        }
        let kind = cli
            .provider
            .or(embeddings.provider)
            .or_else(|| file.default_provider());
        let provider = build_provider(kind, &env.api_keys, &embeddings, create_shared_client())?;

        let db_path = resolve_db_path(cli, &env, &file);
        let pool = Arc::new(
            DatabasePool::open(&db_path)
                .await
                .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
        );
        info!(path = %db_path.display(), model = provider.model_version(), "Database opened");

        let store = Arc::new(SqliteMessageStore::new(pool.clone()));
        let lore = Arc::new(SqliteLorebookSource::new(pool.clone()));
        let cache = Arc::new(EmbeddingCache::new(
            provider,
            memory.cache_capacity,
            memory.embed_timeout(),
        ));
        let manager = MemoryManager::new(
            Arc::new(SqliteVectorBackend::new(pool)),
            store.clone(),
            cache,
            memory,
        );
        let retriever = Retriever::new(manager.clone(), LorebookMatcher::new(lore.clone()));

        Ok(Self {
            store,
            lore,
            manager,
            retriever,
        })
    }

    /// Let queued indexing finish, then stop background work
    pub async fn finish(self) {
        debug!("Waiting for background memory jobs");
        self.manager.wait_idle().await;
        self.manager.shutdown().await;
    }
}
