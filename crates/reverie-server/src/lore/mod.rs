// crates/reverie-server/src/lore/mod.rs
// Keyword-triggered lorebook matching

mod sqlite;

pub use sqlite::SqliteLorebookSource;

use crate::error::Result;
use async_trait::async_trait;
use reverie_types::{CharacterId, LorebookEntry};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Character configuration: the lorebook entries attached to a character
#[async_trait]
pub trait LorebookSource: Send + Sync {
    async fn entries_for(&self, character_id: CharacterId) -> Result<Vec<LorebookEntry>>;
}

/// Fixed in-memory lorebook
#[derive(Debug, Default, Clone)]
pub struct StaticLorebook {
    entries: HashMap<CharacterId, Vec<LorebookEntry>>,
}

impl StaticLorebook {
    pub fn new(entries: impl IntoIterator<Item = LorebookEntry>) -> Self {
        let mut by_character: HashMap<CharacterId, Vec<LorebookEntry>> = HashMap::new();
        for entry in entries {
            by_character.entry(entry.character_id).or_default().push(entry);
        }
        Self {
            entries: by_character,
        }
    }
}

#[async_trait]
impl LorebookSource for StaticLorebook {
    async fn entries_for(&self, character_id: CharacterId) -> Result<Vec<LorebookEntry>> {
        Ok(self.entries.get(&character_id).cloned().unwrap_or_default())
    }
}

/// Length in chars of the longest keyword of `entry` found in `query_lower`
/// on token boundaries; None when no keyword matches.
fn matched_specificity(entry: &LorebookEntry, query_lower: &str) -> Option<usize> {
    entry
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty() && contains_phrase(query_lower, k))
        .map(|k| k.chars().count())
        .max()
}

/// Whether `needle` occurs in `haystack` with no alphanumeric char directly
/// before or after it. Both are expected lowercased.
fn contains_phrase(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}

/// Pick the entries triggered by `query_text`.
///
/// Order: priority desc, longest matched keyword desc, id asc. Capped at `max`.
pub fn select_entries(
    entries: &[LorebookEntry],
    query_text: &str,
    max: usize,
) -> Vec<LorebookEntry> {
    let query_lower = query_text.to_lowercase();
    let mut matched: Vec<(&LorebookEntry, usize)> = entries
        .iter()
        .filter(|e| e.enabled)
        .filter_map(|e| matched_specificity(e, &query_lower).map(|s| (e, s)))
        .collect();

    matched.sort_by(|(a, sa), (b, sb)| {
        b.priority
            .cmp(&a.priority)
            .then(sb.cmp(sa))
            .then(a.id.cmp(&b.id))
    });
    matched.into_iter().take(max).map(|(e, _)| e.clone()).collect()
}

/// Matches a query against a character's lorebook
#[derive(Clone)]
pub struct LorebookMatcher {
    source: Arc<dyn LorebookSource>,
}

impl LorebookMatcher {
    pub fn new(source: Arc<dyn LorebookSource>) -> Self {
        Self { source }
    }

    pub async fn match_entries(
        &self,
        query_text: &str,
        character_id: CharacterId,
        max: usize,
    ) -> Result<Vec<LorebookEntry>> {
        if max == 0 || query_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.source.entries_for(character_id).await?;
        let selected = select_entries(&entries, query_text, max);
        debug!(
            character_id,
            candidates = entries.len(),
            matched = selected.len(),
            "Lorebook match"
        );
        Ok(selected)
    }
}
