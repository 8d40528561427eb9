// crates/reverie-server/src/cli/mod.rs
// CLI module for Reverie commands

use clap::{Parser, Subcommand};
use reverie::embeddings::ProviderKind;
use reverie_types::{CharacterId, ChatId, MessageId, Role};
use std::path::PathBuf;

pub mod app;
pub mod commands;

pub use app::App;

#[derive(Parser)]
#[command(name = "reverie")]
#[command(about = "Long-term conversational memory for chat characters")]
#[command(version)]
pub struct Cli {
    /// Database path (default: ~/.reverie/reverie.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Embedding provider: openai or local
    #[arg(long, global = true, value_parser = parse_provider)]
    pub provider: Option<ProviderKind>,

    /// Debug logging to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or delete chats
    Chat {
        #[command(subcommand)]
        action: ChatAction,
    },

    /// Append a message and index it
    Say {
        chat: ChatId,

        /// user or assistant
        #[arg(short, long, default_value = "user", value_parser = parse_role)]
        role: Role,

        content: String,
    },

    /// Print the retrieval context for a query
    Context {
        chat: ChatId,

        query: String,

        /// Character whose lorebook applies (default: the chat's character)
        #[arg(short, long)]
        character: Option<CharacterId>,

        /// Substituted for {{user}}
        #[arg(long)]
        user_name: Option<String>,

        /// Substituted for {{char}}
        #[arg(long)]
        char_name: Option<String>,

        /// Print the full context as JSON instead of the prompt block
        #[arg(long)]
        json: bool,
    },

    /// Inspect and manage a chat's memories
    Memories {
        #[command(subcommand)]
        action: MemoriesAction,
    },

    /// Rebuild a chat's index from its transcript
    Rebuild {
        chat: ChatId,

        /// Discard the current index before rebuilding
        #[arg(long)]
        full: bool,
    },

    /// Repair drift between indexes and transcripts
    Reconcile {
        /// Only this chat (default: every chat)
        chat: Option<ChatId>,

        /// Keep running, reconciling every chat on the configured interval
        /// until interrupted
        #[arg(long, conflicts_with = "chat")]
        watch: bool,
    },

    /// Manage lorebook entries
    Lore {
        #[command(subcommand)]
        action: LoreAction,
    },
}

#[derive(Subcommand)]
pub enum ChatAction {
    /// Create a chat and print its id
    New {
        #[arg(short, long)]
        character: CharacterId,

        #[arg(short, long)]
        title: Option<String>,
    },
    /// Delete a chat, its transcript and its memories
    Delete { chat: ChatId },
}

#[derive(Subcommand)]
pub enum MemoriesAction {
    /// List indexed memories, oldest first
    List {
        chat: ChatId,

        #[arg(long)]
        json: bool,
    },
    /// Forget one message's memory (the message itself stays)
    Forget { chat: ChatId, message: MessageId },
    /// Forget everything said so far in the chat
    Clear { chat: ChatId },
    /// Index state and counts
    Stats { chat: ChatId },
}

#[derive(Subcommand)]
pub enum LoreAction {
    /// Add an entry
    Add {
        #[arg(short, long)]
        character: CharacterId,

        /// Comma-separated trigger keywords
        #[arg(short, long)]
        keys: String,

        #[arg(short, long, default_value = "0")]
        priority: i32,

        text: String,
    },
    /// List a character's entries
    List {
        #[arg(short, long)]
        character: CharacterId,
    },
    /// Enable or disable an entry
    Toggle {
        entry: i64,

        #[arg(long)]
        off: bool,
    },
}

fn parse_role(s: &str) -> Result<Role, String> {
    Role::parse(s).ok_or_else(|| format!("unknown role '{s}' (expected user or assistant)"))
}

fn parse_provider(s: &str) -> Result<ProviderKind, String> {
    ProviderKind::parse(s).ok_or_else(|| format!("unknown provider '{s}' (expected openai or local)"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_say() {
        let cli = Cli::parse_from(["reverie", "say", "3", "--role", "assistant", "hello there"]);
        match cli.command {
            Commands::Say {
                chat,
                role,
                content,
            } => {
                assert_eq!(chat, 3);
                assert_eq!(role, Role::Assistant);
                assert_eq!(content, "hello there");
            }
            _ => panic!("expected say"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "reverie", "memories", "list", "2", "--provider", "local", "--db", "/tmp/x.db",
        ]);
        assert_eq!(cli.provider, Some(ProviderKind::Local));
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
    }

    #[test]
    fn test_reconcile_watch_excludes_chat() {
        let cli = Cli::parse_from(["reverie", "reconcile", "--watch"]);
        assert!(matches!(
            cli.command,
            Commands::Reconcile {
                chat: None,
                watch: true
            }
        ));
        assert!(Cli::try_parse_from(["reverie", "reconcile", "4", "--watch"]).is_err());
    }

    #[test]
    fn test_rejects_unknown_role() {
        assert!(Cli::try_parse_from(["reverie", "say", "1", "--role", "narrator", "hi"]).is_err());
    }
}
