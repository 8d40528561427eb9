// crates/reverie-server/src/retrieval/context.rs
// Budgeted assembly and prompt rendering of a retrieval context

use crate::config::{BudgetUnit, MemoryConfig, Truncation};
use crate::config::memory::CHARS_PER_TOKEN;
use crate::utils::truncate;
use chrono::{DateTime, Utc};
use reverie_types::{ChatId, LorebookEntry, Message, MessageId, Provenance, Role};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

/// Longest message body `render` prints before cutting
pub const RENDER_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Lore,
    Memory,
    Recent,
}

/// One piece of assembled context
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub provenance: BTreeSet<Provenance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lore_entry_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub truncated: bool,
}

/// Budget accounting for one context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Budget {
    pub unit: BudgetUnit,
    pub limit: usize,
    pub used: usize,
}

impl Budget {
    fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }
}

/// Sources that failed for this turn, with the reason
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relevance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lore: Option<String>,
    /// Fragments left out for lack of budget
    pub dropped: usize,
}

impl Diagnostics {
    pub fn is_degraded(&self) -> bool {
        self.relevance.is_some() || self.recency.is_some() || self.lore.is_some()
    }
}

/// Context for one generation turn: lore, then relevant memories (best first),
/// then the recency window (oldest first).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalContext {
    pub chat_id: ChatId,
    pub fragments: Vec<Fragment>,
    pub budget: Budget,
    pub diagnostics: Diagnostics,
}

impl RetrievalContext {
    fn of_kind(&self, kind: FragmentKind) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter().filter(move |f| f.kind == kind)
    }

    pub fn lore(&self) -> impl Iterator<Item = &Fragment> {
        self.of_kind(FragmentKind::Lore)
    }

    pub fn memories(&self) -> impl Iterator<Item = &Fragment> {
        self.of_kind(FragmentKind::Memory)
    }

    pub fn recent(&self) -> impl Iterator<Item = &Fragment> {
        self.of_kind(FragmentKind::Recent)
    }

    pub fn memory_ids(&self) -> Vec<MessageId> {
        self.memories().filter_map(|f| f.message_id).collect()
    }

    pub fn recent_ids(&self) -> Vec<MessageId> {
        self.recent().filter_map(|f| f.message_id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Prompt block for the generation model; empty when there is nothing
    /// to add.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = Vec::new();

        let lore: Vec<&Fragment> = self.lore().collect();
        if !lore.is_empty() {
            lines.push("[World info:]".to_string());
            lines.extend(lore.iter().map(|f| f.text.clone()));
            lines.push("[End of world info.]".to_string());
        }

        let memories: Vec<&Fragment> = self.memories().collect();
        if !memories.is_empty() {
            lines.push("[Relevant past conversation context:]".to_string());
            lines.extend(memories.iter().map(|f| render_line(f)));
            lines.push("[End of past context. Continue the conversation naturally.]".to_string());
        }

        let recent: Vec<&Fragment> = self.recent().collect();
        if !recent.is_empty() {
            lines.push("[Recent conversation:]".to_string());
            lines.extend(recent.iter().map(|f| render_line(f)));
        }

        lines.join("\n")
    }
}

fn render_line(fragment: &Fragment) -> String {
    let label = fragment.role.map_or("System", |r| r.label());
    format!("{label}: {}", truncate(&fragment.text, RENDER_MAX_CHARS))
}

/// Names substituted for `{{user}}` and `{{char}}`
#[derive(Debug, Clone, Copy, Default)]
pub struct Placeholders<'a> {
    pub user_name: Option<&'a str>,
    pub char_name: Option<&'a str>,
}

impl Placeholders<'_> {
    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();
        if let Some(user) = self.user_name.filter(|n| !n.is_empty()) {
            out = out.replace("{{user}}", user);
        }
        if let Some(chr) = self.char_name.filter(|n| !n.is_empty()) {
            out = out.replace("{{char}}", chr);
        }
        out
    }
}

/// Cut `text` to at most `remaining` budget units
fn fit_to(text: &str, unit: BudgetUnit, remaining: usize) -> String {
    let chars = match unit {
        BudgetUnit::Chars => remaining,
        BudgetUnit::Tokens => remaining * CHARS_PER_TOKEN,
    };
    text.chars().take(chars).collect()
}

struct Assembler {
    budget: Budget,
    truncation: Truncation,
    fragments: Vec<Fragment>,
    dropped: usize,
}

impl Assembler {
    /// Add the fragment if it fits; with partial truncation, cut it to the
    /// remaining budget instead. Returns whether anything was added.
    fn push(&mut self, mut fragment: Fragment) -> bool {
        let cost = self.budget.unit.cost(&fragment.text);
        if cost <= self.budget.remaining() {
            self.budget.used += cost;
            self.fragments.push(fragment);
            return true;
        }
        if self.truncation == Truncation::Partial && self.budget.remaining() > 0 {
            fragment.text = fit_to(&fragment.text, self.budget.unit, self.budget.remaining());
            fragment.truncated = true;
            self.budget.used += self.budget.unit.cost(&fragment.text);
            self.fragments.push(fragment);
            return true;
        }
        self.dropped += 1;
        false
    }

    /// Push in rank order until one does not fit; the rest of the section
    /// is dropped so a lower-ranked fragment never takes a better one's place.
    fn push_section(&mut self, fragments: Vec<Fragment>) {
        let total = fragments.len();
        for (i, fragment) in fragments.into_iter().enumerate() {
            if !self.push(fragment) {
                self.dropped += total - i - 1;
                return;
            }
        }
    }
}

fn message_fragment(
    kind: FragmentKind,
    message: &Message,
    provenance: BTreeSet<Provenance>,
    score: Option<f32>,
    names: Placeholders<'_>,
) -> Fragment {
    Fragment {
        kind,
        provenance,
        message_id: Some(message.id),
        lore_entry_id: None,
        role: Some(message.role),
        text: names.apply(&message.content),
        score,
        created_at: Some(message.created_at),
        truncated: false,
    }
}

/// Merge the three sources under the budget.
///
/// `relevant` is expected best-first and `recent` oldest-first. A message in
/// both appears once, among the memories, tagged with both provenances. Lore
/// is placed first and so never yields budget to memories. Each section is
/// cut from its tail: the first fragment that does not fit ends the section,
/// so the recency window loses its oldest messages first.
pub fn assemble(
    chat_id: ChatId,
    lore: &[LorebookEntry],
    relevant: &[(Message, f32)],
    recent: &[Message],
    config: &MemoryConfig,
    names: Placeholders<'_>,
    diagnostics: Diagnostics,
) -> RetrievalContext {
    let mut asm = Assembler {
        budget: Budget {
            unit: config.budget_unit,
            limit: config.context_budget,
            used: 0,
        },
        truncation: config.truncation,
        fragments: Vec::new(),
        dropped: 0,
    };

    let lore_fragments = lore
        .iter()
        .take(config.max_lore_entries)
        .map(|entry| Fragment {
            kind: FragmentKind::Lore,
            provenance: BTreeSet::from([Provenance::Lore]),
            message_id: None,
            lore_entry_id: Some(entry.id),
            role: None,
            text: names.apply(&entry.injected_text),
            score: None,
            created_at: None,
            truncated: false,
        })
        .collect();
    asm.push_section(lore_fragments);

    let recent_ids: HashSet<MessageId> = recent.iter().map(|m| m.id).collect();
    let mut seen: HashSet<MessageId> = HashSet::new();
    let mut memories = Vec::new();
    for (message, score) in relevant {
        if !seen.insert(message.id) {
            continue;
        }
        let mut provenance = BTreeSet::from([Provenance::Relevance]);
        if recent_ids.contains(&message.id) {
            provenance.insert(Provenance::Recency);
        }
        memories.push(message_fragment(
            FragmentKind::Memory,
            message,
            provenance,
            Some(*score),
            names,
        ));
    }
    asm.push_section(memories);

    // newest first so the oldest go when the budget runs out
    let window = recent
        .iter()
        .rev()
        .filter(|m| !seen.contains(&m.id))
        .map(|m| {
            message_fragment(
                FragmentKind::Recent,
                m,
                BTreeSet::from([Provenance::Recency]),
                None,
                names,
            )
        })
        .collect();
    let start = asm.fragments.len();
    asm.push_section(window);
    asm.fragments[start..].reverse();

    let mut diagnostics = diagnostics;
    diagnostics.dropped += asm.dropped;
    RetrievalContext {
        chat_id,
        fragments: asm.fragments,
        budget: asm.budget,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn msg(id: MessageId, role: Role, content: &str) -> Message {
        Message {
            id,
            chat_id: 1,
            role,
            content: content.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, id as u32, 0).unwrap(),
        }
    }

    fn config(budget: usize) -> MemoryConfig {
        MemoryConfig {
            context_budget: budget,
            ..MemoryConfig::default()
        }
    }

    fn build(
        lore: &[LorebookEntry],
        relevant: &[(Message, f32)],
        recent: &[Message],
        config: &MemoryConfig,
    ) -> RetrievalContext {
        assemble(
            1,
            lore,
            relevant,
            recent,
            config,
            Placeholders::default(),
            Diagnostics::default(),
        )
    }

    // ═══════════════════════════════════════
    // ORDER AND DEDUP
    // ═══════════════════════════════════════

    #[test]
    fn test_order_is_lore_memories_recent() {
        let lore = [LorebookEntry::from_keys(9, 1, "capital", "The Capital never sleeps.", 0)];
        let relevant = [(msg(3, Role::User, "dragons!"), 0.9)];
        let recent = [msg(8, Role::User, "hi"), msg(9, Role::Assistant, "hello")];
        let ctx = build(&lore, &relevant, &recent, &config(10_000));

        let kinds: Vec<FragmentKind> = ctx.fragments.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FragmentKind::Lore,
                FragmentKind::Memory,
                FragmentKind::Recent,
                FragmentKind::Recent
            ]
        );
        assert_eq!(ctx.recent_ids(), vec![8, 9]);
    }

    #[test]
    fn test_message_in_both_sources_appears_once_with_both_tags() {
        let shared = msg(5, Role::User, "the dragon returns");
        let relevant = [(shared.clone(), 0.95)];
        let recent = [msg(4, Role::User, "hmm"), shared];
        let ctx = build(&[], &relevant, &recent, &config(10_000));

        assert_eq!(ctx.memory_ids(), vec![5]);
        assert_eq!(ctx.recent_ids(), vec![4]);
        let memory = ctx.memories().next().unwrap();
        assert_eq!(
            memory.provenance,
            BTreeSet::from([Provenance::Relevance, Provenance::Recency])
        );
    }

    #[test]
    fn test_lore_capped() {
        let lore: Vec<LorebookEntry> = (1..=5)
            .map(|i| LorebookEntry::from_keys(i, 1, "k", format!("lore {i}"), 0))
            .collect();
        let ctx = build(&lore, &[], &[], &config(10_000));
        assert_eq!(ctx.lore().count(), 3);
    }

    // ═══════════════════════════════════════
    // BUDGET
    // ═══════════════════════════════════════

    #[test]
    fn test_recency_drops_oldest_first() {
        let recent = [
            msg(1, Role::User, "aaaaaaaaaa"),
            msg(2, Role::User, "bbbbbbbbbb"),
            msg(3, Role::User, "cccccccccc"),
        ];
        let ctx = build(&[], &[], &recent, &config(25));
        assert_eq!(ctx.recent_ids(), vec![2, 3]);
        assert_eq!(ctx.budget.used, 20);
        assert_eq!(ctx.diagnostics.dropped, 1);
    }

    #[test]
    fn test_lore_kept_ahead_of_memories() {
        let lore = [LorebookEntry::from_keys(1, 1, "k", "x".repeat(30), 0)];
        let relevant = [(msg(2, Role::User, &"y".repeat(30)), 0.8)];
        let ctx = build(&lore, &relevant, &[], &config(40));
        assert_eq!(ctx.lore().count(), 1);
        assert_eq!(ctx.memories().count(), 0);
    }

    #[test]
    fn test_lower_ranked_memory_never_takes_the_budget() {
        let relevant = [
            (msg(1, Role::User, &"a".repeat(30)), 0.95),
            (msg(2, Role::User, &"b".repeat(10)), 0.71),
        ];
        let ctx = build(&[], &relevant, &[], &config(20));
        assert!(ctx.memory_ids().is_empty());
        assert_eq!(ctx.diagnostics.dropped, 2);
        assert_eq!(ctx.budget.used, 0);
    }

    #[test]
    fn test_lore_section_stops_at_first_overflow() {
        let lore = [
            LorebookEntry::from_keys(1, 1, "k", "x".repeat(30), 5),
            LorebookEntry::from_keys(2, 1, "k", "y".repeat(5), 0),
        ];
        let recent = [msg(3, Role::User, "hello")];
        let ctx = build(&lore, &[], &recent, &config(20));
        assert_eq!(ctx.lore().count(), 0);
        assert_eq!(ctx.recent_ids(), vec![3]);
    }

    #[test]
    fn test_partial_truncation_cuts_last_fragment() {
        let mut cfg = config(15);
        cfg.truncation = Truncation::Partial;
        let relevant = [
            (msg(1, Role::User, "0123456789"), 0.9),
            (msg(2, Role::User, "abcdefghij"), 0.8),
        ];
        let ctx = build(&[], &relevant, &[], &cfg);
        let texts: Vec<&str> = ctx.memories().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["0123456789", "abcde"]);
        assert!(ctx.memories().nth(1).unwrap().truncated);
        assert_eq!(ctx.budget.used, 15);
    }

    #[test]
    fn test_token_budget() {
        let mut cfg = config(3);
        cfg.budget_unit = BudgetUnit::Tokens;
        // 9 chars = 3 tokens, fits exactly; the next does not
        let recent = [msg(1, Role::User, "abcdefghi"), msg(2, Role::User, "abcdefghi")];
        let ctx = build(&[], &[], &recent, &cfg);
        assert_eq!(ctx.recent_ids(), vec![2]);
    }

    // ═══════════════════════════════════════
    // RENDERING
    // ═══════════════════════════════════════

    #[test]
    fn test_placeholders() {
        let names = Placeholders {
            user_name: Some("Ada"),
            char_name: Some("Oak"),
        };
        assert_eq!(names.apply("{{user}} meets {{char}}"), "Ada meets Oak");
        assert_eq!(Placeholders::default().apply("{{user}}"), "{{user}}");
    }

    #[test]
    fn test_render_sections() {
        let lore = [LorebookEntry::from_keys(1, 1, "capital", "The Capital is walled.", 0)];
        let relevant = [(msg(3, Role::Assistant, &"z".repeat(600)), 0.9)];
        let recent = [msg(7, Role::User, "and then?")];
        let text = build(&lore, &relevant, &recent, &config(10_000)).render();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[World info:]");
        assert_eq!(lines[1], "The Capital is walled.");
        assert!(lines.contains(&"[Relevant past conversation context:]"));
        assert!(lines.contains(&"[End of past context. Continue the conversation naturally.]"));
        let memory_line = lines.iter().find(|l| l.starts_with("Character: ")).unwrap();
        assert!(memory_line.ends_with("..."));
        assert_eq!(lines.last(), Some(&"User: and then?"));
    }

    #[test]
    fn test_render_empty_context() {
        assert_eq!(build(&[], &[], &[], &config(100)).render(), "");
    }
}
