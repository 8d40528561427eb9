// crates/reverie-server/src/embeddings/openai.rs
// OpenAI embeddings API client

use super::{EmbeddingProvider, ProviderError, check_model_version};
use crate::http::{FAST_TIMEOUT, create_shared_client};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

const API_URL: &str = "https://api.openai.com/v1/embeddings";

/// Max input tokens for embedding models
const MAX_INPUT_TOKENS: usize = 8192;

const CHARS_PER_TOKEN: usize = 4;

const MAX_TEXT_CHARS: usize = MAX_INPUT_TOKENS * CHARS_PER_TOKEN;

/// Max texts per request; larger batches are split and sent concurrently
const MAX_BATCH_SIZE: usize = 256;

/// OpenAI embedding models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenAiEmbeddingModel {
    #[default]
    TextEmbedding3Small,
    TextEmbedding3Large,
}

impl OpenAiEmbeddingModel {
    pub fn model_name(&self) -> &'static str {
        match self {
            Self::TextEmbedding3Small => "text-embedding-3-small",
            Self::TextEmbedding3Large => "text-embedding-3-large",
        }
    }

    pub fn default_dimensions(&self) -> usize {
        match self {
            Self::TextEmbedding3Small => 1536,
            Self::TextEmbedding3Large => 3072,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "text-embedding-3-small" => Some(Self::TextEmbedding3Small),
            "text-embedding-3-large" => Some(Self::TextEmbedding3Large),
            _ => None,
        }
    }
}

impl std::fmt::Display for OpenAiEmbeddingModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.model_name())
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// OpenAI embeddings client
pub struct OpenAiEmbeddings {
    api_key: String,
    model: OpenAiEmbeddingModel,
    dimensions: usize,
    model_version: String,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: String) -> Self {
        Self::with_http_client(
            api_key,
            OpenAiEmbeddingModel::default(),
            None,
            create_shared_client(),
        )
    }

    pub fn with_http_client(
        api_key: String,
        model: OpenAiEmbeddingModel,
        dimensions: Option<usize>,
        http_client: reqwest::Client,
    ) -> Self {
        let dimensions = dimensions.unwrap_or_else(|| model.default_dimensions());
        Self {
            api_key,
            model,
            dimensions,
            model_version: format!("openai/{}@{}", model.model_name(), dimensions),
            http_client,
        }
    }

    pub fn model(&self) -> OpenAiEmbeddingModel {
        self.model
    }

    /// One request for up to MAX_BATCH_SIZE texts
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let inputs: Vec<&str> = texts
            .iter()
            .map(|t| match t.char_indices().nth(MAX_TEXT_CHARS) {
                Some((cut, _)) => {
                    debug!(chars = MAX_TEXT_CHARS, "Truncating embedding input");
                    &t[..cut]
                }
                None => t.as_str(),
            })
            .collect();

        let body = serde_json::json!({
            "input": inputs,
            "model": self.model.model_name(),
            "dimensions": self.dimensions,
            "encoding_format": "float"
        });

        let response = self
            .http_client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let msg = serde_json::from_str::<ErrorResponse>(&error_text)
                .map(|e| e.error.message)
                .unwrap_or(error_text);
            return Err(classify_status(status, msg));
        }

        let resp: EmbeddingResponse = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("failed to parse embedding response: {e}"))
        })?;

        let mut data = resp.data;
        data.sort_by_key(|d| d.index);
        let embeddings: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();

        if embeddings.len() != texts.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dimensions) {
            return Err(ProviderError::InvalidResponse(format!(
                "dimension mismatch: expected {}, got {}",
                self.dimensions,
                bad.len()
            )));
        }

        Ok(embeddings)
    }
}

fn classify_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(FAST_TIMEOUT)
    } else {
        ProviderError::Network(e.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, msg: String) -> ProviderError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Quota(msg)
    } else if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
        ProviderError::Network(format!("OpenAI API error {status}: {msg}"))
    } else {
        ProviderError::InvalidResponse(format!("OpenAI API error {status}: {msg}"))
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str, model_version: &str) -> Result<Vec<f32>, ProviderError> {
        check_model_version(&self.model_version, model_version)?;
        self.embed_texts(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("empty embedding response".to_string()))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        model_version: &str,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        check_model_version(&self.model_version, model_version)?;
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.len() <= MAX_BATCH_SIZE {
            return self.embed_texts(texts).await;
        }

        let chunks: Vec<&[String]> = texts.chunks(MAX_BATCH_SIZE).collect();
        debug!(
            texts = texts.len(),
            batches = chunks.len(),
            "Embedding in parallel batches"
        );

        let futures: Vec<_> = chunks
            .into_iter()
            .map(|chunk| self.embed_texts(chunk))
            .collect();
        let results = futures::future::join_all(futures).await;

        let mut all_results = Vec::with_capacity(texts.len());
        for result in results {
            all_results.extend(result?);
        }
        Ok(all_results)
    }
}
