// crates/reverie-server/src/config/file.rs
// File-based configuration from ~/.reverie/config.toml

use super::memory::MemoryConfig;
use crate::embeddings::ProviderKind;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Top-level config structure
#[derive(Debug, Deserialize, Default)]
pub struct ReverieConfig {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsFileConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[embeddings]` section
#[derive(Debug, Deserialize, Default)]
pub struct EmbeddingsFileConfig {
    /// "openai" or "local"
    pub provider: Option<String>,
    pub model: Option<String>,
    pub dimensions: Option<usize>,
}

/// `[storage]` section
#[derive(Debug, Deserialize, Default)]
pub struct StorageConfig {
    pub db_path: Option<PathBuf>,
}

impl ReverieConfig {
    /// Load config from ~/.reverie/config.toml, falling back to defaults
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!(path = %path.display(), "Loaded config from file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse config file");
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
        }
    }

    /// Directory holding config, `.env` and the default database
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".reverie")
    }

    fn config_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    pub fn default_provider(&self) -> Option<ProviderKind> {
        self.embeddings
            .provider
            .as_deref()
            .and_then(ProviderKind::parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[memory]
similarity_threshold = 0.6
recency_window = 8

[embeddings]
provider = "local"
dimensions = 128

[storage]
db_path = "/tmp/reverie-test.db"
"#;
        let config: ReverieConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.memory.similarity_threshold, 0.6);
        assert_eq!(config.memory.recency_window, 8);
        assert_eq!(config.memory.top_k, 5);
        assert_eq!(config.default_provider(), Some(ProviderKind::Local));
        assert_eq!(config.embeddings.dimensions, Some(128));
        assert_eq!(
            config.storage.db_path.as_deref(),
            Some(Path::new("/tmp/reverie-test.db"))
        );
    }

    #[test]
    fn test_parse_empty_config() {
        let config: ReverieConfig = toml::from_str("").unwrap();
        assert_eq!(config.default_provider(), None);
        assert_eq!(config.memory, MemoryConfig::default());
    }

    #[test]
    fn test_load_from_missing_and_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ReverieConfig::load_from(&dir.path().join("absent.toml"));
        assert_eq!(missing.memory, MemoryConfig::default());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[memory\ntop_k = ").unwrap();
        let config = ReverieConfig::load_from(&broken);
        assert_eq!(config.memory, MemoryConfig::default());
    }
}
