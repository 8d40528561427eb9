//! crates/reverie-server/src/utils.rs
//! Shared utility functions used across the codebase

use std::path::Path;

/// Convert a path to an owned string (lossy on non-UTF-8).
pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Truncate a string to `max_chars` characters with an ellipsis.
///
/// Cuts on a char boundary; the result is at most `max_chars + 3` chars.
pub fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((byte_idx, _)) => format!("{}...", &s[..byte_idx]),
    }
}

/// Serialize an embedding as little-endian f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Inverse of [`embedding_to_bytes`]. None when the length is not a multiple of 4.
pub fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_to_string() {
        let path = std::path::PathBuf::from("/home/user/.reverie/reverie.db");
        assert_eq!(path_to_string(&path), "/home/user/.reverie/reverie.db");
    }

    #[test]
    fn test_truncate_short_string() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_long_string() {
        assert_eq!(truncate("hello world", 5), "hello...");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("héllo wörld", 7), "héllo w...");
    }

    #[test]
    fn test_embedding_bytes() {
        let v = vec![0.5f32, -1.25, 3.0];
        let bytes = embedding_to_bytes(&v);
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes_to_embedding(&bytes), Some(v));
        assert_eq!(bytes_to_embedding(&bytes[..5]), None);
    }
}
