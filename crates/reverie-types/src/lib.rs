// crates/reverie-types/src/lib.rs
// Shared types for Reverie (transcript, lore and memory records)
// Serde-only: no storage or runtime dependencies allowed here

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type ChatId = i64;
pub type MessageId = i64;
pub type CharacterId = i64;

/// Number of characters kept in a memory's content preview
pub const PREVIEW_CHARS: usize = 100;

// ═══════════════════════════════════════
// TRANSCRIPT
// ═══════════════════════════════════════

/// Speaker of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Parse from the stored lowercase name
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "assistant" | "character" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    /// Label used when rendering prompt context
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Character",
            Role::System => "System",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transcript message. Owned by the message store; immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// True when there is nothing worth embedding
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }

    pub fn preview(&self) -> String {
        content_preview(&self.content)
    }
}

/// First [`PREVIEW_CHARS`] characters of `content`, cut on a char boundary.
pub fn content_preview(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

// ═══════════════════════════════════════
// LORE
// ═══════════════════════════════════════

/// Keyword-triggered snippet attached to a character
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LorebookEntry {
    pub id: i64,
    pub character_id: CharacterId,
    pub keywords: BTreeSet<String>,
    pub injected_text: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl LorebookEntry {
    /// Build an entry from a comma-separated key list ("dragon, wyrm").
    /// Blank keys are dropped.
    pub fn from_keys(
        id: i64,
        character_id: CharacterId,
        keys: &str,
        injected_text: impl Into<String>,
        priority: i32,
    ) -> Self {
        Self {
            id,
            character_id,
            keywords: parse_keys(keys),
            injected_text: injected_text.into(),
            priority,
            enabled: true,
        }
    }

    /// Keywords joined back into the stored comma-separated form
    pub fn keys_string(&self) -> String {
        self.keywords.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

/// Split a comma-separated key list, trimming and dropping blanks
pub fn parse_keys(keys: &str) -> BTreeSet<String> {
    keys.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

// ═══════════════════════════════════════
// MEMORY
// ═══════════════════════════════════════

/// One row of `list_memories`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryListing {
    pub message_id: MessageId,
    pub role: Role,
    pub content_preview: String,
    pub created_at: DateTime<Utc>,
}

/// Result of forgetting a single memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Removed,
    NotFound,
}

/// Where a context fragment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Lore,
    Relevance,
    Recency,
}

/// Lifecycle state of a per-chat vector index handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Uninitialized,
    Loading,
    Rebuilding,
    Ready,
    Degraded,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::Uninitialized => "uninitialized",
            IndexState::Loading => "loading",
            IndexState::Rebuilding => "rebuilding",
            IndexState::Ready => "ready",
            IndexState::Degraded => "degraded",
        }
    }

    /// Only a ready index answers searches
    pub fn is_searchable(&self) -> bool {
        matches!(self, IndexState::Ready)
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-chat memory statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub chat_id: ChatId,
    pub state: IndexState,
    pub total_vectors: usize,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub model_version: Option<String>,
    pub dimensions: Option<usize>,
}
