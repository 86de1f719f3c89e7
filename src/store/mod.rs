//! Persistence boundary for contacts, conversations and messages.
//!
//! Every uniqueness rule the pipeline depends on lives behind these traits:
//! callers never look up and then insert, they ask for an upsert.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::StoreError,
    types::{
        ChatMessage, Contact, Conversation, ConversationStatus, ConversationWithContact,
        MessageRole, Platform,
    },
};

/// Result of [`MessageLog::append`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Created(ChatMessage),
    /// The platform message id was already stored for this conversation.
    Duplicate(ChatMessage),
}

impl AppendOutcome {
    pub fn message(&self) -> &ChatMessage {
        match self {
            AppendOutcome::Created(message) | AppendOutcome::Duplicate(message) => message,
        }
    }

    pub fn into_message(self) -> ChatMessage {
        match self {
            AppendOutcome::Created(message) | AppendOutcome::Duplicate(message) => message,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, AppendOutcome::Duplicate(_))
    }
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Upsert keyed on `(platform, external_id)`. A blank name hint falls
    /// back to the external id; an existing contact is returned untouched.
    async fn resolve(
        &self,
        platform: Platform,
        external_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<Contact, StoreError>;

    async fn get_contact(&self, id: &str) -> Result<Contact, StoreError>;

    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Returns the current (not closed) conversation for the pair, creating
    /// an active, bot-enabled one when there is none.
    async fn get_or_create(
        &self,
        contact_id: &str,
        channel: Platform,
    ) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError>;

    /// Newest activity first.
    async fn list_conversations(&self) -> Result<Vec<ConversationWithContact>, StoreError>;

    async fn set_bot_enabled(&self, id: &str, enabled: bool) -> Result<Conversation, StoreError>;

    /// Fails with [`StoreError::InvalidTransition`] once the conversation is closed.
    async fn set_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, StoreError>;

    async fn touch_last_message(&self, id: &str, at: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Inserts the message and bumps the conversation's `last_message_at`
    /// in one step. A repeated `platform_message_id` yields
    /// [`AppendOutcome::Duplicate`] with the stored message.
    async fn append(
        &self,
        conversation_id: &str,
        content: &str,
        role: MessageRole,
        platform_message_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<AppendOutcome, StoreError>;

    /// The newest `limit` messages, oldest first.
    async fn list_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// The whole log, oldest first.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError>;
}

pub trait Store: ContactDirectory + ConversationStore + MessageLog {}

impl<T> Store for T where T: ContactDirectory + ConversationStore + MessageLog {}

pub(crate) fn contact_name(external_id: &str, hint: Option<&str>) -> String {
    hint.map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(external_id)
        .to_string()
}
