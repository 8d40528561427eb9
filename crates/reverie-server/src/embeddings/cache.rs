// crates/reverie-server/src/embeddings/cache.rs
// Content-addressed LRU cache in front of an embedding provider

use super::{EmbeddingProvider, ProviderError};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::debug;

type CacheKey = [u8; 32];
type Vector = Arc<Vec<f32>>;
type Outcome = Option<Result<Vector, ProviderError>>;

/// Separates model version from content in the hashed key
const KEY_SEPARATOR: u8 = 0x1f;

fn cache_key(content: &str, model_version: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(model_version.as_bytes());
    hasher.update([KEY_SEPARATOR]);
    hasher.update(content.as_bytes());
    hasher.finalize().into()
}

/// Counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// A provider call some caller has claimed for a key
struct Registered {
    id: u64,
    outcome: watch::Receiver<Outcome>,
}

enum Claim<'a> {
    Lead(Flight<'a>),
    Wait(watch::Receiver<Outcome>),
}

/// The claimant's side of an in-flight call. Dropping it unregisters the
/// key, so a cancelled caller never leaves a stale entry behind; waiters
/// then see the channel close and try again.
struct Flight<'a> {
    cache: &'a EmbeddingCache,
    key: CacheKey,
    id: u64,
    tx: watch::Sender<Outcome>,
}

impl Flight<'_> {
    fn publish(self, outcome: Result<Vector, ProviderError>) {
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.cache.lock_in_flight();
        if in_flight.get(&self.key).is_some_and(|r| r.id == self.id) {
            in_flight.remove(&self.key);
        }
    }
}

/// Resolves once the claimant publishes. None if it went away without one.
async fn await_outcome(mut rx: watch::Receiver<Outcome>) -> Outcome {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone(),
        Err(_) => None,
    }
}

/// Deduplicates embedding calls for identical `(content, model_version)`.
///
/// Concurrent misses for one key share a single provider call, whether they
/// come through `get_or_create` or `get_or_create_batch`. Failed calls are
/// never cached. Each provider call is bounded by `timeout`; retries are the
/// caller's business.
pub struct EmbeddingCache {
    provider: Arc<dyn EmbeddingProvider>,
    entries: Mutex<LruCache<CacheKey, Vector>>,
    in_flight: StdMutex<HashMap<CacheKey, Registered>>,
    next_flight: AtomicU64,
    timeout: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, capacity: usize, timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            provider,
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: StdMutex::new(HashMap::new()),
            next_flight: AtomicU64::new(0),
            timeout,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Version vectors are produced under right now
    pub fn model_version(&self) -> &str {
        self.provider.model_version()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, Registered>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Calls currently registered; zero once every caller has finished or
    /// been cancelled
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    async fn cached(&self, key: &CacheKey) -> Option<Vector> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Join the call already running for `key`, or register a new one
    fn claim(&self, key: CacheKey) -> Claim<'_> {
        let mut in_flight = self.lock_in_flight();
        if let Some(running) = in_flight.get(&key) {
            return Claim::Wait(running.outcome.clone());
        }
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let (tx, outcome) = watch::channel(None);
        in_flight.insert(key, Registered { id, outcome });
        Claim::Lead(Flight {
            cache: self,
            key,
            id,
            tx,
        })
    }

    pub async fn get_or_create(
        &self,
        content: &str,
        model_version: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        let key = cache_key(content, model_version);
        loop {
            if let Some(v) = self.cached(&key).await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(v.as_ref().clone());
            }

            let flight = match self.claim(key) {
                Claim::Wait(rx) => match await_outcome(rx).await {
                    Some(outcome) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return outcome.map(|v| v.as_ref().clone());
                    }
                    None => continue,
                },
                Claim::Lead(flight) => flight,
            };

            // A call may have published between the lookup and the claim
            if let Some(v) = self.cached(&key).await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                flight.publish(Ok(v.clone()));
                return Ok(v.as_ref().clone());
            }

            self.misses.fetch_add(1, Ordering::Relaxed);
            let result = self
                .call_provider(content, model_version)
                .await
                .map(Arc::new);
            // Entries before the flight is unregistered, so late callers hit
            if let Ok(v) = &result {
                self.insert(key, v.clone()).await;
            }
            flight.publish(result.clone());
            return result.map(|v| v.as_ref().clone());
        }
    }

    /// Embed many texts; misses nobody else is computing go to the provider
    /// in one batch call. Output order matches input order.
    pub async fn get_or_create_batch(
        &self,
        contents: &[String],
        model_version: &str,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let keys: Vec<CacheKey> = contents
            .iter()
            .map(|c| cache_key(c, model_version))
            .collect();

        let mut hits = 0u64;
        let mut found: HashMap<CacheKey, Vector> = HashMap::new();
        let mut missing: Vec<(CacheKey, &str)> = Vec::new();
        {
            let mut seen = HashSet::new();
            let mut entries = self.entries.lock().await;
            for (key, content) in keys.iter().zip(contents) {
                if !seen.insert(*key) {
                    hits += 1;
                    continue;
                }
                match entries.get(key) {
                    Some(v) => {
                        hits += 1;
                        found.insert(*key, v.clone());
                    }
                    None => missing.push((*key, content.as_str())),
                }
            }
        }

        let mut leading = Vec::new();
        let mut waiting = Vec::new();
        for (key, content) in missing {
            match self.claim(key) {
                Claim::Lead(flight) => leading.push((flight, content)),
                Claim::Wait(rx) => waiting.push((key, content, rx)),
            }
        }

        let mut owned = Vec::with_capacity(leading.len());
        {
            let mut entries = self.entries.lock().await;
            for (flight, content) in leading {
                match entries.get(&flight.key).cloned() {
                    Some(v) => {
                        hits += 1;
                        found.insert(flight.key, v.clone());
                        flight.publish(Ok(v));
                    }
                    None => owned.push((flight, content)),
                }
            }
        }

        // Publish our own keys before waiting on anyone else's
        if !owned.is_empty() {
            self.misses.fetch_add(owned.len() as u64, Ordering::Relaxed);
            let texts: Vec<String> = owned.iter().map(|(_, c)| c.to_string()).collect();
            debug!(count = texts.len(), "Embedding cache batch miss");
            match self.call_provider_batch(&texts, model_version).await {
                Ok(vectors) => {
                    for ((flight, _), v) in owned.into_iter().zip(vectors) {
                        let v = Arc::new(v);
                        self.insert(flight.key, v.clone()).await;
                        found.insert(flight.key, v.clone());
                        flight.publish(Ok(v));
                    }
                }
                Err(e) => {
                    for (flight, _) in owned {
                        flight.publish(Err(e.clone()));
                    }
                    self.hits.fetch_add(hits, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        self.hits.fetch_add(hits, Ordering::Relaxed);
        for (key, content, rx) in waiting {
            let v = match await_outcome(rx).await {
                Some(outcome) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    outcome?
                }
                // The other caller went away; embed it ourselves
                None => Arc::new(self.get_or_create(content, model_version).await?),
            };
            found.insert(key, v);
        }

        keys.iter()
            .map(|k| {
                found.get(k).map(|v| v.as_ref().clone()).ok_or_else(|| {
                    ProviderError::InvalidResponse("batch result missing an entry".to_string())
                })
            })
            .collect()
    }

    async fn call_provider(
        &self,
        content: &str,
        model_version: &str,
    ) -> Result<Vec<f32>, ProviderError> {
        let v = match tokio::time::timeout(self.timeout, self.provider.embed(content, model_version))
            .await
        {
            Ok(r) => r?,
            Err(_) => return Err(ProviderError::Timeout(self.timeout)),
        };
        self.check_vector(&v)?;
        Ok(v)
    }

    async fn call_provider_batch(
        &self,
        texts: &[String],
        model_version: &str,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let vectors = match tokio::time::timeout(
            self.timeout,
            self.provider.embed_batch(texts, model_version),
        )
        .await
        {
            Ok(r) => r?,
            Err(_) => return Err(ProviderError::Timeout(self.timeout)),
        };
        if vectors.len() != texts.len() {
            return Err(ProviderError::InvalidResponse(format!(
                "batch returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        for v in &vectors {
            self.check_vector(v)?;
        }
        Ok(vectors)
    }

    /// Right dimension, finite components
    fn check_vector(&self, v: &[f32]) -> Result<(), ProviderError> {
        let expected = self.provider.dimensions();
        if v.len() != expected {
            return Err(ProviderError::InvalidResponse(format!(
                "dimension mismatch: expected {expected}, got {}",
                v.len()
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(ProviderError::InvalidResponse(
                "vector has non-finite components".to_string(),
            ));
        }
        Ok(())
    }

    async fn insert(&self, key: CacheKey, v: Vector) {
        let mut entries = self.entries.lock().await;
        if let Some((evicted, _)) = entries.push(key, v)
            && evicted != key
        {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.lock().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEmbedder;

    fn cache_with(embedder: Arc<ScriptedEmbedder>, capacity: usize) -> EmbeddingCache {
        EmbeddingCache::new(embedder, capacity, Duration::from_secs(5))
    }

    #[test]
    fn test_key_depends_on_model_version() {
        assert_ne!(cache_key("hello", "v1"), cache_key("hello", "v2"));
        assert_eq!(cache_key("hello", "v1"), cache_key("hello", "v1"));
        // separator keeps (version, content) boundaries distinct
        assert_ne!(cache_key("bc", "a"), cache_key("c", "ab"));
    }

    #[tokio::test]
    async fn test_hit_does_not_call_provider() {
        let embedder = Arc::new(ScriptedEmbedder::new());
        let cache = cache_with(embedder.clone(), 16);
        let version = embedder.model_version().to_string();

        let a = cache.get_or_create("dragons fly", &version).await.unwrap();
        let b = cache.get_or_create("dragons fly", &version).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(embedder.calls(), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_call() {
        let embedder = Arc::new(ScriptedEmbedder::new().with_latency(Duration::from_millis(50)));
        let cache = Arc::new(cache_with(embedder.clone(), 16));
        let version = embedder.model_version().to_string();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let version = version.clone();
            handles.push(tokio::spawn(async move {
                cache.get_or_create("same text", &version).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(embedder.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_and_batch_share_one_call() {
        let embedder = Arc::new(ScriptedEmbedder::new().with_latency(Duration::from_millis(50)));
        let cache = cache_with(embedder.clone(), 16);
        let version = embedder.model_version().to_string();
        let texts = vec!["the dragon sleeps".to_string()];

        let (single, batch) = tokio::join!(
            cache.get_or_create("the dragon sleeps", &version),
            cache.get_or_create_batch(&texts, &version),
        );

        assert_eq!(batch.unwrap(), vec![single.unwrap()]);
        assert_eq!(embedder.calls(), 1);
        assert_eq!(cache.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_batches_embed_each_text_once() {
        let embedder = Arc::new(ScriptedEmbedder::new().with_latency(Duration::from_millis(50)));
        let cache = cache_with(embedder.clone(), 16);
        let version = embedder.model_version().to_string();
        let first = vec!["alpha".to_string(), "beta".to_string()];
        let second = vec!["beta".to_string(), "gamma".to_string()];

        let (a, b) = tokio::join!(
            cache.get_or_create_batch(&first, &version),
            cache.get_or_create_batch(&second, &version),
        );

        assert_eq!(a.unwrap()[1], b.unwrap()[0]);
        assert_eq!(embedder.calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_caller_leaves_nothing_in_flight() {
        let embedder = Arc::new(ScriptedEmbedder::new().with_latency(Duration::from_millis(100)));
        let cache = cache_with(embedder.clone(), 16);
        let version = embedder.model_version().to_string();

        let cut_short = tokio::time::timeout(
            Duration::from_millis(10),
            cache.get_or_create("slow words", &version),
        )
        .await;
        assert!(cut_short.is_err());
        assert_eq!(cache.in_flight(), 0);

        assert!(cache.get_or_create("slow words", &version).await.is_ok());
        assert_eq!(embedder.calls(), 2);
    }

    struct NanEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for NanEmbedder {
        fn model_version(&self) -> &str {
            "nan-v1"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(
            &self,
            _text: &str,
            _model_version: &str,
        ) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![f32::NAN, 1.0])
        }

        async fn embed_batch(
            &self,
            texts: &[String],
            _model_version: &str,
        ) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![f32::NAN, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_non_finite_vectors_are_rejected() {
        let cache = EmbeddingCache::new(Arc::new(NanEmbedder), 4, Duration::from_secs(1));

        let single = cache.get_or_create("x", "nan-v1").await.unwrap_err();
        assert!(matches!(single, ProviderError::InvalidResponse(_)));
        let batch = cache
            .get_or_create_batch(&["y".to_string()], "nan-v1")
            .await
            .unwrap_err();
        assert!(matches!(batch, ProviderError::InvalidResponse(_)));
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let embedder = Arc::new(ScriptedEmbedder::new());
        let cache = cache_with(embedder.clone(), 16);
        let version = embedder.model_version().to_string();

        embedder.fail_with(Some(ProviderError::Network("down".into())));
        assert!(cache.get_or_create("lost words", &version).await.is_err());

        embedder.fail_with(None);
        assert!(cache.get_or_create("lost words", &version).await.is_ok());
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let embedder = Arc::new(ScriptedEmbedder::new());
        let cache = cache_with(embedder.clone(), 2);
        let version = embedder.model_version().to_string();

        cache.get_or_create("one", &version).await.unwrap();
        cache.get_or_create("two", &version).await.unwrap();
        cache.get_or_create("three", &version).await.unwrap();
        cache.get_or_create("one", &version).await.unwrap();

        assert_eq!(embedder.calls(), 4);
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 2);
        assert!(stats.evictions >= 1);
    }

    #[tokio::test]
    async fn test_batch_embeds_only_misses() {
        let embedder = Arc::new(ScriptedEmbedder::new());
        let cache = cache_with(embedder.clone(), 16);
        let version = embedder.model_version().to_string();

        let single = cache.get_or_create("alpha", &version).await.unwrap();
        let batch = cache
            .get_or_create_batch(
                &["alpha".to_string(), "beta".to_string(), "beta".to_string()],
                &version,
            )
            .await
            .unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], single);
        assert_eq!(batch[1], batch[2]);
        assert_eq!(embedder.batch_calls(), 1);
        assert_eq!(embedder.calls(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let embedder = Arc::new(ScriptedEmbedder::new().with_latency(Duration::from_millis(200)));
        let cache = EmbeddingCache::new(embedder.clone(), 4, Duration::from_millis(10));
        let version = embedder.model_version().to_string();

        let err = cache.get_or_create("slow", &version).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }
}
