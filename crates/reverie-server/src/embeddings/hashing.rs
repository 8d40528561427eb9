// crates/reverie-server/src/embeddings/hashing.rs
// Offline feature-hashing embedder (deterministic, no network)

use super::{EmbeddingProvider, ProviderError, check_model_version, normalize};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

pub const DEFAULT_DIMENSIONS: usize = 384;

/// Bag-of-words feature hashing: each lowercase word and each adjacent word
/// pair is hashed to a signed bucket, then the vector is L2-normalized.
///
/// Texts sharing vocabulary land close together, which is enough for local
/// use and demos. Blank text maps to the zero vector.
pub struct HashingEmbedder {
    dimensions: usize,
    model_version: String,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_version: format!("local/hashing-v1@{dimensions}"),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let mut v = vec![0.0f32; self.dimensions];
        for word in &words {
            self.add_feature(&mut v, word.as_bytes(), 1.0);
        }
        for pair in words.windows(2) {
            let feature = format!("{} {}", pair[0], pair[1]);
            self.add_feature(&mut v, feature.as_bytes(), 0.5);
        }
        normalize(v)
    }

    fn add_feature(&self, v: &mut [f32], feature: &[u8], weight: f32) {
        let digest = Sha256::digest(feature);
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str, model_version: &str) -> Result<Vec<f32>, ProviderError> {
        check_model_version(&self.model_version, model_version)?;
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        model_version: &str,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        check_model_version(&self.model_version, model_version)?;
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}
