// crates/reverie-server/src/config/env.rs
// Environment-based configuration - single source of truth for env vars

use crate::embeddings::ProviderKind;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// API keys loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// OpenAI API key (OPENAI_API_KEY)
    pub openai: Option<String>,
}

impl ApiKeys {
    pub fn from_env() -> Self {
        let keys = Self {
            openai: read_key("OPENAI_API_KEY"),
        };
        keys.log_status();
        keys
    }

    /// Log which keys are available (without exposing values)
    fn log_status(&self) {
        if self.openai.is_some() {
            debug!("OpenAI API key loaded");
        } else {
            warn!("No OPENAI_API_KEY configured - only the local embedder is available");
        }
    }

    pub fn has_embeddings(&self) -> bool {
        self.openai.is_some()
    }

    pub fn summary(&self) -> String {
        if self.openai.is_some() {
            "OpenAI".to_string()
        } else {
            "None".to_string()
        }
    }
}

/// Read a single value, filtering empty strings
fn read_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

/// Embeddings configuration from environment variables
#[derive(Debug, Clone, Default)]
pub struct EmbeddingsConfig {
    /// REVERIE_EMBEDDING_PROVIDER (openai | local)
    pub provider: Option<ProviderKind>,
    /// REVERIE_EMBEDDING_MODEL
    pub model: Option<String>,
    /// REVERIE_EMBEDDING_DIMENSIONS
    pub dimensions: Option<usize>,
}

impl EmbeddingsConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| read_key(name))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let provider = lookup("REVERIE_EMBEDDING_PROVIDER").and_then(|p| {
            let parsed = ProviderKind::parse(&p);
            if parsed.is_none() {
                warn!(value = %p, "Unknown REVERIE_EMBEDDING_PROVIDER, ignoring");
            }
            parsed
        });
        let dimensions = lookup("REVERIE_EMBEDDING_DIMENSIONS").and_then(|d| d.parse().ok());
        if let Some(dims) = dimensions {
            debug!(dimensions = dims, "Custom embedding dimensions configured");
        }

        Self {
            provider,
            model: lookup("REVERIE_EMBEDDING_MODEL"),
            dimensions,
        }
    }
}

/// Configuration validation result
#[derive(Debug)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Default for ConfigValidation {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn merge(&mut self, other: ConfigValidation) {
        self.warnings.extend(other.warnings);
        self.errors.extend(other.errors);
    }

    /// Format as a human-readable report
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for err in &self.errors {
                lines.push(format!("  - {err}"));
            }
        }

        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            for warn in &self.warnings {
                lines.push(format!("  - {warn}"));
            }
        }

        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Environment configuration - all env vars in one place
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub api_keys: ApiKeys,
    pub embeddings: EmbeddingsConfig,
    /// Database path override (REVERIE_DB)
    pub db_path: Option<PathBuf>,
}

impl EnvConfig {
    /// Load all environment configuration (call once at startup)
    pub fn load() -> Self {
        info!("Loading environment configuration");

        Self {
            api_keys: ApiKeys::from_env(),
            embeddings: EmbeddingsConfig::from_env(),
            db_path: read_key("REVERIE_DB").map(PathBuf::from),
        }
    }

    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.embeddings.provider == Some(ProviderKind::OpenAi) && !self.api_keys.has_embeddings()
        {
            validation.add_error(
                "REVERIE_EMBEDDING_PROVIDER=openai requires OPENAI_API_KEY to be set",
            );
        }
        if self.embeddings.dimensions == Some(0) {
            validation.add_error("REVERIE_EMBEDDING_DIMENSIONS must be greater than zero");
        }

        validation
    }
}
