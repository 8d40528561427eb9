// crates/reverie-server/src/config/memory.rs
// Retrieval and lifecycle tuning knobs

use super::env::ConfigValidation;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Characters per token when the budget is expressed in tokens
pub const CHARS_PER_TOKEN: usize = 4;

/// Unit the context budget is measured in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetUnit {
    #[default]
    Chars,
    Tokens,
}

impl BudgetUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chars" | "characters" => Some(BudgetUnit::Chars),
            "tokens" => Some(BudgetUnit::Tokens),
            _ => None,
        }
    }

    /// Cost of `text` in this unit (tokens round up)
    pub fn cost(&self, text: &str) -> usize {
        let chars = text.chars().count();
        match self {
            BudgetUnit::Chars => chars,
            BudgetUnit::Tokens => chars.div_ceil(CHARS_PER_TOKEN),
        }
    }
}

/// What happens to a fragment that does not fit the remaining budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Truncation {
    /// Drop the fragment entirely
    #[default]
    WholeFragment,
    /// Keep as much of the fragment as fits, marked with an ellipsis
    Partial,
}

impl Truncation {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "whole_fragment" | "whole" | "drop" => Some(Truncation::WholeFragment),
            "partial" => Some(Truncation::Partial),
            _ => None,
        }
    }
}

/// Bounded exponential backoff for provider and store calls
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 250,
            max_delay_ms: 8000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries, for tests and one-shot CLI calls
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Base delay before retry number `attempt` (0-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Memory engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Minimum cosine similarity for a relevance hit
    pub similarity_threshold: f32,
    pub top_k: usize,
    /// Last N transcript messages always offered to the prompt
    pub recency_window: usize,
    pub max_lore_entries: usize,
    pub context_budget: usize,
    pub budget_unit: BudgetUnit,
    pub truncation: Truncation,
    /// Embedding cache capacity in entries
    pub cache_capacity: usize,
    pub max_background_jobs: usize,
    pub embed_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub retry: RetryConfig,
    pub rebuild_batch_size: usize,
    /// How long a degraded index waits before the next rebuild attempt
    pub degraded_retry_after_secs: u64,
    pub reconcile_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            top_k: 5,
            recency_window: 5,
            max_lore_entries: 3,
            context_budget: 12_000,
            budget_unit: BudgetUnit::Chars,
            truncation: Truncation::WholeFragment,
            cache_capacity: 4096,
            max_background_jobs: 4,
            embed_timeout_secs: 30,
            store_timeout_secs: 10,
            retry: RetryConfig::default(),
            rebuild_batch_size: 64,
            degraded_retry_after_secs: 60,
            reconcile_interval_secs: 300,
        }
    }
}

impl MemoryConfig {
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn degraded_retry_after(&self) -> Duration {
        Duration::from_secs(self.degraded_retry_after_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Apply `REVERIE_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            let raw = lookup(name)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(var = name, value = %raw, "Ignoring unparseable override");
                    None
                }
            }
        }

        if let Some(v) = parsed(&lookup, "REVERIE_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "REVERIE_TOP_K") {
            self.top_k = v;
        }
        if let Some(v) = parsed(&lookup, "REVERIE_RECENCY_WINDOW") {
            self.recency_window = v;
        }
        if let Some(v) = parsed(&lookup, "REVERIE_MAX_LORE_ENTRIES") {
            self.max_lore_entries = v;
        }
        if let Some(v) = parsed(&lookup, "REVERIE_CONTEXT_BUDGET") {
            self.context_budget = v;
        }
        if let Some(unit) = lookup("REVERIE_BUDGET_UNIT").and_then(|s| BudgetUnit::parse(&s)) {
            self.budget_unit = unit;
        }
        if let Some(t) = lookup("REVERIE_TRUNCATION").and_then(|s| Truncation::parse(&s)) {
            self.truncation = t;
        }
        if let Some(v) = parsed(&lookup, "REVERIE_CACHE_CAPACITY") {
            self.cache_capacity = v;
        }
        if let Some(v) = parsed(&lookup, "REVERIE_MAX_BACKGROUND_JOBS") {
            self.max_background_jobs = v;
        }
        if let Some(v) = parsed(&lookup, "REVERIE_EMBED_TIMEOUT_SECS") {
            self.embed_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "REVERIE_MAX_RETRIES") {
            self.retry.max_retries = v;
        }
    }

    /// Check ranges; warnings for odd-but-usable values
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            validation.add_error(format!(
                "similarity_threshold {} is outside [-1, 1]",
                self.similarity_threshold
            ));
        }
        if self.context_budget == 0 {
            validation.add_error("context_budget must be greater than zero");
        }
        if self.cache_capacity == 0 {
            validation.add_error("cache_capacity must be greater than zero");
        }
        if self.max_background_jobs == 0 {
            validation.add_error("max_background_jobs must be greater than zero");
        }
        if self.rebuild_batch_size == 0 {
            validation.add_error("rebuild_batch_size must be greater than zero");
        }
        if self.top_k == 0 {
            validation.add_warning("top_k is 0: relevance retrieval is disabled");
        }
        if self.recency_window == 0 {
            validation.add_warning("recency_window is 0: no recent history will be offered");
        }
        if self.retry.backoff_multiplier < 1.0 {
            validation.add_warning("retry.backoff_multiplier below 1.0 is treated as 1.0");
        }

        validation
    }
}
