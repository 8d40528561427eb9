// crates/reverie-server/src/embeddings/mod.rs
// Embedding providers and the shared embedding cache

mod cache;
mod hashing;
mod openai;

pub use self::cache::{CacheStats, EmbeddingCache};
pub use self::hashing::HashingEmbedder;
pub use self::openai::{OpenAiEmbeddingModel, OpenAiEmbeddings};

use crate::config::{ApiKeys, EmbeddingsConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Which embedding backend to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Local,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ProviderKind::OpenAi),
            "local" | "hashing" => Some(ProviderKind::Local),
            _ => None,
        }
    }
}

/// Classified embedding failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding quota exceeded: {0}")]
    Quota(String),

    #[error("embedding network failure: {0}")]
    Network(String),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Timeouts, rate limits and transport failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::InvalidResponse(_))
    }
}

/// Text to fixed-dimension vector.
///
/// `model_version` identifies the model and output dimension; callers pass the
/// version they expect so a swapped provider cannot silently mix vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn model_version(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str, model_version: &str) -> Result<Vec<f32>, ProviderError>;

    /// Embed several texts in one call; output order matches input order.
    async fn embed_batch(
        &self,
        texts: &[String],
        model_version: &str,
    ) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Reject requests for a model version this provider does not serve.
pub(crate) fn check_model_version(expected: &str, requested: &str) -> Result<(), ProviderError> {
    if expected == requested {
        Ok(())
    } else {
        Err(ProviderError::InvalidResponse(format!(
            "provider serves {expected}, caller asked for {requested}"
        )))
    }
}

/// Build the configured provider. Falls back to the local embedder when no
/// provider is named and no OpenAI key is available.
pub fn build_provider(
    kind: Option<ProviderKind>,
    api_keys: &ApiKeys,
    config: &EmbeddingsConfig,
    http_client: reqwest::Client,
) -> crate::Result<Arc<dyn EmbeddingProvider>> {
    let kind = kind.unwrap_or(if api_keys.has_embeddings() {
        ProviderKind::OpenAi
    } else {
        ProviderKind::Local
    });

    match kind {
        ProviderKind::OpenAi => {
            let api_key = api_keys.openai.clone().ok_or_else(|| {
                crate::ReverieError::Config("OPENAI_API_KEY is not set".to_string())
            })?;
            let model = match config.model.as_deref() {
                Some(name) => OpenAiEmbeddingModel::from_name(name).ok_or_else(|| {
                    crate::ReverieError::Config(format!("unknown embedding model {name}"))
                })?,
                None => OpenAiEmbeddingModel::default(),
            };
            tracing::info!(model = %model, "Using OpenAI embeddings");
            Ok(Arc::new(OpenAiEmbeddings::with_http_client(
                api_key,
                model,
                config.dimensions,
                http_client,
            )))
        }
        ProviderKind::Local => {
            let dims = config.dimensions.unwrap_or(hashing::DEFAULT_DIMENSIONS);
            tracing::info!(dimensions = dims, "Using local hashing embeddings");
            Ok(Arc::new(HashingEmbedder::new(dims)))
        }
    }
}

/// Scale to unit length; zero vectors are returned unchanged.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
