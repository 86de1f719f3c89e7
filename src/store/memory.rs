use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{contact_name, AppendOutcome, ContactDirectory, ConversationStore, MessageLog};
use crate::{
    error::StoreError,
    types::{
        now_iso, ChatMessage, Contact, Conversation, ConversationStatus, ConversationWithContact,
        MessageRole, Platform,
    },
};

#[derive(Default)]
struct Tables {
    contacts: HashMap<String, Contact>,
    contact_keys: HashMap<(Platform, String), String>,
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, Vec<ChatMessage>>,
    next_seq: i64,
}

impl Tables {
    fn conversation_mut(&mut self, id: &str) -> Result<&mut Conversation, StoreError> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }
}

/// Process-local store. All tables sit behind one lock, so each operation is
/// atomic the way a single SQL statement would be.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContactDirectory for MemoryStore {
    async fn resolve(
        &self,
        platform: Platform,
        external_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<Contact, StoreError> {
        let mut tables = self.tables.write().await;
        let key = (platform, external_id.to_string());
        if let Some(existing) = tables
            .contact_keys
            .get(&key)
            .and_then(|id| tables.contacts.get(id))
        {
            return Ok(existing.clone());
        }

        let contact = Contact {
            id: Uuid::new_v4().to_string(),
            platform,
            external_id: external_id.to_string(),
            name: contact_name(external_id, display_name_hint),
            metadata: json!({}),
            created_at: now_iso(),
        };
        tables.contact_keys.insert(key, contact.id.clone());
        tables.contacts.insert(contact.id.clone(), contact.clone());
        Ok(contact)
    }

    async fn get_contact(&self, id: &str) -> Result<Contact, StoreError> {
        let tables = self.tables.read().await;
        tables
            .contacts
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("contact", id))
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        let tables = self.tables.read().await;
        let mut list = tables.contacts.values().cloned().collect::<Vec<_>>();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(list)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get_or_create(
        &self,
        contact_id: &str,
        channel: Platform,
    ) -> Result<Conversation, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.contacts.contains_key(contact_id) {
            return Err(StoreError::not_found("contact", contact_id));
        }
        if let Some(current) = tables.conversations.values().find(|c| {
            c.contact_id == contact_id && c.channel == channel && c.status != ConversationStatus::Closed
        }) {
            return Ok(current.clone());
        }

        let now = now_iso();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            contact_id: contact_id.to_string(),
            channel,
            status: ConversationStatus::Active,
            bot_enabled: true,
            last_message_at: now.clone(),
            created_at: now,
        };
        tables
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        let tables = self.tables.read().await;
        tables
            .conversations
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationWithContact>, StoreError> {
        let tables = self.tables.read().await;
        let mut list = tables
            .conversations
            .values()
            .filter_map(|conversation| {
                let contact = tables.contacts.get(&conversation.contact_id)?;
                Some(ConversationWithContact {
                    conversation: conversation.clone(),
                    contact: contact.clone(),
                })
            })
            .collect::<Vec<_>>();
        list.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
        });
        Ok(list)
    }

    async fn set_bot_enabled(&self, id: &str, enabled: bool) -> Result<Conversation, StoreError> {
        let mut tables = self.tables.write().await;
        let conversation = tables.conversation_mut(id)?;
        conversation.bot_enabled = enabled;
        Ok(conversation.clone())
    }

    async fn set_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, StoreError> {
        let mut tables = self.tables.write().await;
        let conversation = tables.conversation_mut(id)?;
        if conversation.status == ConversationStatus::Closed && status != ConversationStatus::Closed
        {
            return Err(StoreError::InvalidTransition { id: id.to_string() });
        }
        conversation.status = status;
        Ok(conversation.clone())
    }

    async fn touch_last_message(&self, id: &str, at: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.conversation_mut(id)?.last_message_at = at.to_string();
        Ok(())
    }
}

#[async_trait]
impl MessageLog for MemoryStore {
    async fn append(
        &self,
        conversation_id: &str,
        content: &str,
        role: MessageRole,
        platform_message_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<AppendOutcome, StoreError> {
        let mut tables = self.tables.write().await;
        tables.conversation_mut(conversation_id)?;

        if let Some(platform_id) = platform_message_id {
            let existing = tables.messages.get(conversation_id).and_then(|log| {
                log.iter()
                    .find(|m| m.platform_message_id.as_deref() == Some(platform_id))
            });
            if let Some(existing) = existing {
                return Ok(AppendOutcome::Duplicate(existing.clone()));
            }
        }

        tables.next_seq += 1;
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            role,
            platform_message_id: platform_message_id.map(str::to_string),
            metadata: metadata.unwrap_or_else(|| json!({})),
            created_at: now_iso(),
            seq: tables.next_seq,
        };
        tables.conversation_mut(conversation_id)?.last_message_at = message.created_at.clone();
        tables
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(AppendOutcome::Created(message))
    }

    async fn list_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let tables = self.tables.read().await;
        let log = tables
            .messages
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
