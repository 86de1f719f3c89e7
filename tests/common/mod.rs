#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use inbox_relay::{
    delivery::PlatformSender,
    error::{DeliveryError, GenerationError, StoreError},
    generator::ResponseGenerator,
    store::{AppendOutcome, ContactDirectory, ConversationStore, MemoryStore, MessageLog},
    types::{
        ChatMessage, Contact, Conversation, ConversationStatus, ConversationWithContact,
        InboundEvent, MessageRole, Platform,
    },
};
use serde_json::Value;
use tokio::sync::mpsc;

enum Script {
    Reply(String),
    Slow(String, Duration),
    Fail,
    Hang,
}

/// Generator double that counts calls and keeps every context it was given.
pub struct ScriptedGenerator {
    script: Script,
    calls: AtomicUsize,
    contexts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    fn with(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn replying(reply: &str) -> Arc<Self> {
        Self::with(Script::Reply(reply.to_string()))
    }

    pub fn slow(reply: &str, delay: Duration) -> Arc<Self> {
        Self::with(Script::Slow(reply.to_string(), delay))
    }

    pub fn failing() -> Arc<Self> {
        Self::with(Script::Fail)
    }

    pub fn hanging() -> Arc<Self> {
        Self::with(Script::Hang)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> Vec<String> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseGenerator for ScriptedGenerator {
    async fn generate(&self, _user_text: &str, context: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.to_string());
        match &self.script {
            Script::Reply(reply) => Ok(reply.clone()),
            Script::Slow(reply, delay) => {
                tokio::time::sleep(*delay).await;
                Ok(reply.clone())
            }
            Script::Fail => Err(GenerationError::Unavailable("provider down".into())),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("too late".into())
            }
        }
    }
}

/// Sender double that forwards `(external_id, text)` to the test.
pub struct RecordingSender {
    tx: mpsc::UnboundedSender<(String, String)>,
}

impl RecordingSender {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl PlatformSender for RecordingSender {
    async fn send_text(&self, contact: &Contact, text: &str) -> Result<(), DeliveryError> {
        let _ = self.tx.send((contact.external_id.clone(), text.to_string()));
        Ok(())
    }
}

pub async fn next_delivery(
    rx: &mut mpsc::UnboundedReceiver<(String, String)>,
) -> (String, String) {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery within 2s")
        .expect("sender alive")
}

pub fn whatsapp_event(external_id: &str, text: &str, message_id: Option<&str>) -> InboundEvent {
    InboundEvent {
        platform: Platform::Whatsapp,
        external_id: external_id.to_string(),
        text: text.to_string(),
        platform_message_id: message_id.map(str::to_string),
        display_name: None,
    }
}

/// Store call that [`FailingStore`] breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breakage {
    /// `append` of a message with this role.
    Append(MessageRole),
    SetStatus,
}

/// `MemoryStore` that fails one kind of call with a database error.
pub struct FailingStore {
    inner: MemoryStore,
    breakage: Breakage,
}

impl FailingStore {
    pub fn new(breakage: Breakage) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            breakage,
        })
    }
}

fn database_down() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl ContactDirectory for FailingStore {
    async fn resolve(
        &self,
        platform: Platform,
        external_id: &str,
        display_name_hint: Option<&str>,
    ) -> Result<Contact, StoreError> {
        self.inner
            .resolve(platform, external_id, display_name_hint)
            .await
    }

    async fn get_contact(&self, id: &str) -> Result<Contact, StoreError> {
        self.inner.get_contact(id).await
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, StoreError> {
        self.inner.list_contacts().await
    }
}

#[async_trait]
impl ConversationStore for FailingStore {
    async fn get_or_create(
        &self,
        contact_id: &str,
        channel: Platform,
    ) -> Result<Conversation, StoreError> {
        self.inner.get_or_create(contact_id, channel).await
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation, StoreError> {
        self.inner.get_conversation(id).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationWithContact>, StoreError> {
        self.inner.list_conversations().await
    }

    async fn set_bot_enabled(&self, id: &str, enabled: bool) -> Result<Conversation, StoreError> {
        self.inner.set_bot_enabled(id, enabled).await
    }

    async fn set_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, StoreError> {
        if self.breakage == Breakage::SetStatus {
            return Err(database_down());
        }
        self.inner.set_status(id, status).await
    }

    async fn touch_last_message(&self, id: &str, at: &str) -> Result<(), StoreError> {
        self.inner.touch_last_message(id, at).await
    }
}

#[async_trait]
impl MessageLog for FailingStore {
    async fn append(
        &self,
        conversation_id: &str,
        content: &str,
        role: MessageRole,
        platform_message_id: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<AppendOutcome, StoreError> {
        if self.breakage == Breakage::Append(role) {
            return Err(database_down());
        }
        self.inner
            .append(conversation_id, content, role, platform_message_id, metadata)
            .await
    }

    async fn list_recent(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.inner.list_recent(conversation_id, limit).await
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        self.inner.list_messages(conversation_id).await
    }
}
