// crates/reverie-server/src/cli/commands.rs
// Command handlers

use super::{App, ChatAction, Commands, LoreAction, MemoriesAction};
use anyhow::{Result, anyhow};
use reverie::lore::LorebookSource;
use reverie::retrieval::ContextRequest;
use reverie_types::{ChatId, DeleteOutcome};

pub async fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Chat { action } => run_chat(app, action).await,
        Commands::Say {
            chat,
            role,
            content,
        } => {
            let message = app.store.insert_message(chat, role, content).await?;
            app.manager.on_message_created(message.clone());
            println!("{}", message.id);
            Ok(())
        }
        Commands::Context {
            chat,
            query,
            character,
            user_name,
            char_name,
            json,
        } => {
            let character_id = match character {
                Some(id) => id,
                None => chat_character(app, chat).await?,
            };
            let request =
                ContextRequest::new(chat, character_id, query).with_names(user_name, char_name);
            let context = app.retriever.get_context(&request).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&context)?);
            } else {
                let diagnostics = &context.diagnostics;
                for (source, reason) in [
                    ("relevance", &diagnostics.relevance),
                    ("recency", &diagnostics.recency),
                    ("lore", &diagnostics.lore),
                ] {
                    if let Some(reason) = reason {
                        eprintln!("note: {source} unavailable: {reason}");
                    }
                }
                println!("{}", context.render());
            }
            Ok(())
        }
        Commands::Memories { action } => run_memories(app, action).await,
        Commands::Rebuild { chat, full } => {
            require_chat(app, chat).await?;
            let report = if full {
                app.manager.reindex(chat).await?
            } else {
                app.manager.rebuild(chat).await?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Reconcile { watch: true, .. } => {
            let (stop, worker) = reverie::background::spawn(app.manager.clone());
            tokio::signal::ctrl_c().await?;
            let _ = stop.send(true);
            worker.await?;
            Ok(())
        }
        Commands::Reconcile { chat, .. } => {
            let reports = match chat {
                Some(chat) => {
                    require_chat(app, chat).await?;
                    vec![app.manager.reconcile(chat).await?]
                }
                None => app.manager.reconcile_all().await,
            };
            println!("{}", serde_json::to_string_pretty(&reports)?);
            Ok(())
        }
        Commands::Lore { action } => run_lore(app, action).await,
    }
}

async fn require_chat(app: &App, chat: ChatId) -> Result<()> {
    chat_character(app, chat).await.map(|_| ())
}

async fn chat_character(app: &App, chat: ChatId) -> Result<i64> {
    app.store
        .chat(chat)
        .await?
        .map(|c| c.character_id)
        .ok_or_else(|| anyhow!("chat {chat} not found"))
}

async fn run_chat(app: &App, action: ChatAction) -> Result<()> {
    match action {
        ChatAction::New { character, title } => {
            let id = app.store.create_chat(character, title).await?;
            println!("{id}");
        }
        ChatAction::Delete { chat } => {
            app.manager.delete_chat(chat).await?;
            if app.store.delete_chat(chat).await? {
                println!("Deleted chat {chat}");
            } else {
                println!("Chat {chat} not found");
            }
        }
    }
    Ok(())
}

async fn run_memories(app: &App, action: MemoriesAction) -> Result<()> {
    match action {
        MemoriesAction::List { chat, json } => {
            let memories = app.manager.list_memories(chat).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&memories)?);
            } else if memories.is_empty() {
                println!("No memories for chat {chat}");
            } else {
                for m in &memories {
                    println!(
                        "{:>6}  {:<9}  {}  {}",
                        m.message_id,
                        m.role.as_str(),
                        m.created_at.format("%Y-%m-%d %H:%M"),
                        m.content_preview
                    );
                }
            }
        }
        MemoriesAction::Forget { chat, message } => {
            match app.manager.delete_memory(chat, message).await? {
                DeleteOutcome::Removed => println!("Forgot message {message}"),
                DeleteOutcome::NotFound => println!("No memory for message {message}"),
            }
        }
        MemoriesAction::Clear { chat } => {
            app.manager.clear_memories(chat).await?;
            println!("Cleared memories for chat {chat}");
        }
        MemoriesAction::Stats { chat } => {
            let stats = app.manager.stats(chat).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

async fn run_lore(app: &App, action: LoreAction) -> Result<()> {
    match action {
        LoreAction::Add {
            character,
            keys,
            priority,
            text,
        } => {
            let entry = app.lore.add_entry(character, &keys, &text, priority).await?;
            println!("{}", entry.id);
        }
        LoreAction::List { character } => {
            let entries = app.lore.entries_for(character).await?;
            for e in &entries {
                println!(
                    "{:>4}  {}  p={}  [{}]  {}",
                    e.id,
                    if e.enabled { "on " } else { "off" },
                    e.priority,
                    e.keys_string(),
                    e.injected_text
                );
            }
        }
        LoreAction::Toggle { entry, off } => {
            if app.lore.set_enabled(entry, !off).await? {
                println!("Entry {entry} {}", if off { "disabled" } else { "enabled" });
            } else {
                println!("Entry {entry} not found");
            }
        }
    }
    Ok(())
}
