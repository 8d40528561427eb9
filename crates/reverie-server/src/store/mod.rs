// crates/reverie-server/src/store/mod.rs
// Authoritative transcript access

mod sqlite;

pub use sqlite::SqliteMessageStore;

use crate::error::Result;
use async_trait::async_trait;
use reverie_types::{ChatId, Message, MessageId};

/// Read side of the transcript. The memory layer never writes messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages of a chat in id order; with `since_id`, only ids greater than it
    async fn get_messages(&self, chat_id: ChatId, since_id: Option<MessageId>)
    -> Result<Vec<Message>>;

    async fn get_message(&self, message_id: MessageId) -> Result<Option<Message>>;

    /// Last `n` messages, oldest first
    async fn recent_messages(&self, chat_id: ChatId, n: usize) -> Result<Vec<Message>>;

    async fn latest_message_id(&self, chat_id: ChatId) -> Result<Option<MessageId>>;
}
