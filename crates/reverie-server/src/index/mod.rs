// crates/reverie-server/src/index/mod.rs
// Per-chat vector index: exact cosine search over normalized vectors

mod backend;
mod handle;
mod registry;
mod sqlite;

pub use backend::{Exclusions, PersistedIndex, VectorBackend};
pub use handle::{HandleInner, IndexHandle};
pub use registry::IndexRegistry;
pub use sqlite::SqliteVectorBackend;

use crate::embeddings::normalize;
use crate::error::{Result, ReverieError};
use crate::utils::embedding_to_bytes;
use chrono::{DateTime, Utc};
use reverie_types::{ChatId, MemoryListing, Message, MessageId, Role};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// One stored memory record: the vector plus what listing and tie-breaking need
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPoint {
    pub message_id: MessageId,
    pub role: Role,
    pub content_preview: String,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
    pub vector: Vec<f32>,
}

impl MemoryPoint {
    /// Build a point for `message`; the vector is normalized here.
    pub fn from_message(message: &Message, vector: Vec<f32>) -> Self {
        Self {
            message_id: message.id,
            role: message.role,
            content_preview: message.preview(),
            created_at: message.created_at,
            indexed_at: Utc::now(),
            vector: normalize(vector),
        }
    }

    pub fn listing(&self) -> MemoryListing {
        MemoryListing {
            message_id: self.message_id,
            role: self.role,
            content_preview: self.content_preview.clone(),
            created_at: self.created_at,
        }
    }

    fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.message_id.to_le_bytes());
        hasher.update(embedding_to_bytes(&self.vector));
        hasher.finalize().into()
    }
}

/// Persisted summary used to validate an index on load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub model_version: String,
    pub dimension: usize,
    pub count: usize,
    /// Hex XOR of per-point SHA-256 digests (order independent)
    pub checksum: String,
}

/// A single search result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub message_id: MessageId,
    pub score: f32,
}

fn xor_into(acc: &mut [u8; 32], digest: &[u8; 32]) {
    for (a, b) in acc.iter_mut().zip(digest) {
        *a ^= b;
    }
}

/// Cosine similarity of two vectors (0.0 when either is zero)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// message id -> vector for one chat. All points share `dimension` and
/// `model_version`.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    model_version: String,
    dimension: usize,
    points: HashMap<MessageId, MemoryPoint>,
    checksum: [u8; 32],
}

impl VectorIndex {
    pub fn new(model_version: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_version: model_version.into(),
            dimension,
            points: HashMap::new(),
            checksum: [0u8; 32],
        }
    }

    /// Rebuild from persisted points, validating them against the manifest.
    ///
    /// Any disagreement (foreign model or dimension, count or checksum
    /// mismatch, wrong-length vectors) makes the artifact unusable.
    pub fn from_persisted(
        chat_id: ChatId,
        persisted: PersistedIndex,
        expected_model: &str,
        expected_dimension: usize,
    ) -> Result<Self> {
        let PersistedIndex { manifest, points } = persisted;
        if manifest.model_version != expected_model {
            return Err(ReverieError::index_unavailable(
                chat_id,
                format!(
                    "model version changed ({} -> {})",
                    manifest.model_version, expected_model
                ),
            ));
        }
        if manifest.dimension != expected_dimension {
            return Err(ReverieError::index_unavailable(
                chat_id,
                format!(
                    "dimension changed ({} -> {})",
                    manifest.dimension, expected_dimension
                ),
            ));
        }

        let mut index = Self::new(expected_model, expected_dimension);
        for point in points {
            index.upsert(point).map_err(|e| {
                ReverieError::index_unavailable(chat_id, format!("bad stored vector: {e}"))
            })?;
        }

        if index.len() != manifest.count {
            return Err(ReverieError::index_unavailable(
                chat_id,
                format!("count mismatch: manifest {}, found {}", manifest.count, index.len()),
            ));
        }
        if index.checksum_hex() != manifest.checksum {
            return Err(ReverieError::index_unavailable(chat_id, "checksum mismatch"));
        }
        Ok(index)
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.points.contains_key(&message_id)
    }

    pub fn get(&self, message_id: MessageId) -> Option<&MemoryPoint> {
        self.points.get(&message_id)
    }

    pub fn points(&self) -> impl Iterator<Item = &MemoryPoint> {
        self.points.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = MessageId> + '_ {
        self.points.keys().copied()
    }

    /// Insert or replace. Rejects vectors of the wrong dimension.
    pub fn upsert(&mut self, point: MemoryPoint) -> Result<()> {
        if point.vector.len() != self.dimension {
            return Err(ReverieError::DimensionMismatch {
                expected: self.dimension,
                actual: point.vector.len(),
            });
        }
        xor_into(&mut self.checksum, &point.digest());
        if let Some(old) = self.points.insert(point.message_id, point) {
            xor_into(&mut self.checksum, &old.digest());
        }
        Ok(())
    }

    /// Remove a point; returns whether it was present
    pub fn remove(&mut self, message_id: MessageId) -> bool {
        match self.points.remove(&message_id) {
            Some(old) => {
                xor_into(&mut self.checksum, &old.digest());
                true
            }
            None => false,
        }
    }

    /// Top `top_k` points by cosine similarity. Ties go to the most recent
    /// message (`created_at` desc, then id desc). Points scoring NaN are skipped.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<SearchHit> {
        if top_k == 0 || query.len() != self.dimension {
            return Vec::new();
        }
        let mut scored: Vec<(&MemoryPoint, f32)> = self
            .points
            .values()
            .map(|p| (p, cosine_similarity(&p.vector, query)))
            .filter(|(_, score)| score.is_finite())
            .collect();

        scored.sort_by(|(pa, sa), (pb, sb)| {
            sb.total_cmp(sa)
                .then_with(|| pb.created_at.cmp(&pa.created_at))
                .then_with(|| pb.message_id.cmp(&pa.message_id))
        });

        scored
            .into_iter()
            .take(top_k)
            .map(|(p, score)| SearchHit {
                message_id: p.message_id,
                score,
            })
            .collect()
    }

    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }

    pub fn manifest(&self) -> Manifest {
        Manifest {
            model_version: self.model_version.clone(),
            dimension: self.dimension,
            count: self.points.len(),
            checksum: self.checksum_hex(),
        }
    }

    /// Manifest as it would be after upserting `points`, without applying them
    pub fn manifest_with(&self, points: &[MemoryPoint], removed: &[MessageId]) -> Manifest {
        let mut preview = self.clone();
        for id in removed {
            preview.remove(*id);
        }
        for p in points {
            // dimension already checked by callers; a mismatch leaves the preview unchanged
            let _ = preview.upsert(p.clone());
        }
        preview.manifest()
    }

    /// Highest indexed message id
    pub fn max_message_id(&self) -> Option<MessageId> {
        self.points.keys().copied().max()
    }

    /// Listing sorted chronologically
    pub fn listings(&self) -> Vec<MemoryListing> {
        let mut points: Vec<&MemoryPoint> = self.points.values().collect();
        points.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.message_id.cmp(&b.message_id))
        });
        points.into_iter().map(MemoryPoint::listing).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(id: MessageId, minute: u32, vector: Vec<f32>) -> MemoryPoint {
        MemoryPoint {
            message_id: id,
            role: Role::User,
            content_preview: format!("message {id}"),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 12, minute, 0).unwrap(),
            indexed_at: Utc.with_ymd_and_hms(2026, 1, 1, 13, 0, 0).unwrap(),
            vector,
        }
    }

    #[test]
    fn test_self_similarity_ranks_first() {
        let mut index = VectorIndex::new("v1", 3);
        index.upsert(point(1, 0, vec![1.0, 0.0, 0.0])).unwrap();
        index.upsert(point(2, 1, vec![0.0, 1.0, 0.0])).unwrap();
        index.upsert(point(3, 2, vec![0.7, 0.7, 0.0])).unwrap();

        let hits = index.search(&[0.0, 2.0, 0.0], 3);
        assert_eq!(hits[0].message_id, 2);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert_eq!(hits[1].message_id, 3);
    }

    #[test]
    fn test_nan_scores_are_skipped() {
        let mut index = VectorIndex::new("v1", 2);
        index.upsert(point(1, 0, vec![1.0, 0.0])).unwrap();
        index.upsert(point(2, 1, vec![f32::NAN, 1.0])).unwrap();
        index.upsert(point(3, 2, vec![0.6, 0.8])).unwrap();

        let ids: Vec<MessageId> = index
            .search(&[1.0, 0.0], 5)
            .iter()
            .map(|h| h.message_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(index.search(&[f32::NAN, 0.0], 5).is_empty());
    }

    #[test]
    fn test_ties_prefer_most_recent() {
        let mut index = VectorIndex::new("v1", 2);
        index.upsert(point(10, 5, vec![1.0, 0.0])).unwrap();
        index.upsert(point(11, 9, vec![1.0, 0.0])).unwrap();
        index.upsert(point(12, 9, vec![1.0, 0.0])).unwrap();

        let ids: Vec<_> = index.search(&[1.0, 0.0], 3).iter().map(|h| h.message_id).collect();
        assert_eq!(ids, vec![12, 11, 10]);
    }

    #[test]
    fn test_upsert_is_idempotent_and_rejects_wrong_dimension() {
        let mut index = VectorIndex::new("v1", 2);
        index.upsert(point(1, 0, vec![1.0, 0.0])).unwrap();
        let checksum = index.checksum_hex();
        index.upsert(point(1, 0, vec![1.0, 0.0])).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.checksum_hex(), checksum);

        let err = index.upsert(point(2, 0, vec![1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, ReverieError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut index = VectorIndex::new("v1", 2);
        assert!(!index.remove(99));
        index.upsert(point(1, 0, vec![0.0, 1.0])).unwrap();
        assert!(index.remove(1));
        assert!(index.is_empty());
        assert_eq!(index.checksum_hex(), hex::encode([0u8; 32]));
    }

    #[test]
    fn test_checksum_is_order_independent() {
        let mut a = VectorIndex::new("v1", 2);
        a.upsert(point(1, 0, vec![1.0, 0.0])).unwrap();
        a.upsert(point(2, 1, vec![0.0, 1.0])).unwrap();
        let mut b = VectorIndex::new("v1", 2);
        b.upsert(point(2, 1, vec![0.0, 1.0])).unwrap();
        b.upsert(point(1, 0, vec![1.0, 0.0])).unwrap();
        assert_eq!(a.manifest(), b.manifest());
    }

    #[test]
    fn test_manifest_with_previews_without_mutating() {
        let mut index = VectorIndex::new("v1", 2);
        index.upsert(point(1, 0, vec![1.0, 0.0])).unwrap();
        let preview = index.manifest_with(&[point(2, 1, vec![0.0, 1.0])], &[1]);
        assert_eq!(preview.count, 1);
        assert_eq!(index.len(), 1);
        assert!(index.contains(1));
    }

    #[test]
    fn test_from_persisted_validates() {
        let mut index = VectorIndex::new("v1", 2);
        index.upsert(point(1, 0, vec![1.0, 0.0])).unwrap();
        index.upsert(point(2, 1, vec![0.0, 1.0])).unwrap();
        let points: Vec<MemoryPoint> = index.points().cloned().collect();

        let good = PersistedIndex {
            manifest: index.manifest(),
            points: points.clone(),
        };
        let loaded = VectorIndex::from_persisted(7, good.clone(), "v1", 2).unwrap();
        assert_eq!(loaded.len(), 2);

        let err = VectorIndex::from_persisted(7, good.clone(), "v2", 2).unwrap_err();
        assert!(matches!(err, ReverieError::IndexUnavailable { chat_id: 7, .. }));

        let mut short = good.clone();
        short.points.pop();
        assert!(VectorIndex::from_persisted(7, short, "v1", 2).is_err());

        let mut tampered = good;
        tampered.points[0].vector = vec![0.5, 0.5];
        assert!(VectorIndex::from_persisted(7, tampered, "v1", 2).is_err());
    }

    #[test]
    fn test_listings_are_chronological() {
        let mut index = VectorIndex::new("v1", 2);
        index.upsert(point(3, 30, vec![1.0, 0.0])).unwrap();
        index.upsert(point(1, 10, vec![1.0, 0.0])).unwrap();
        let ids: Vec<_> = index.listings().iter().map(|l| l.message_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
