use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    broadcast::Broadcaster, config::Config, delivery::PlatformSender, ingest::IngestController,
    store::Store,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Whatsapp,
    Instagram,
    Facebook,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Whatsapp => "whatsapp",
            Platform::Instagram => "instagram",
            Platform::Facebook => "facebook",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Ok(Platform::Whatsapp),
            "instagram" => Ok(Platform::Instagram),
            "facebook" | "messenger" => Ok(Platform::Facebook),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

/// Routing state of a conversation. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    AgentPaused,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::AgentPaused => "agent_paused",
            ConversationStatus::Closed => "closed",
        }
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "active" => Ok(ConversationStatus::Active),
            "agent_paused" => Ok(ConversationStatus::AgentPaused),
            "closed" => Ok(ConversationStatus::Closed),
            other => Err(format!("unknown conversation status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Agent,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Agent => "agent",
            MessageRole::System => "system",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "agent" => Ok(MessageRole::Agent),
            "system" => Ok(MessageRole::System),
            other => Err(format!("unknown message role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub platform: Platform,
    pub external_id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub contact_id: String,
    pub channel: Platform,
    pub status: ConversationStatus,
    pub bot_enabled: bool,
    pub last_message_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: String,
    /// Store-assigned position; strictly increasing within a conversation.
    pub seq: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationWithContact {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub contact: Contact,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationWithMessages {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub messages: Vec<ChatMessage>,
}

/// Validated inbound chat event, independent of the provider envelope it
/// arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub platform: Platform,
    pub external_id: String,
    pub text: String,
    pub platform_message_id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleBotBody {
    pub bot_enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageBody {
    pub content: String,
}

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub broadcaster: Broadcaster,
    pub ingest: IngestController,
    pub delivery: Arc<dyn PlatformSender>,
    pub config: Arc<Config>,
}

/// Fixed-width RFC 3339 so stored timestamps also sort lexically.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub fn json_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

pub fn parse_json_text(value: &str) -> Value {
    serde_json::from_str::<Value>(value).unwrap_or_else(|_| json!({}))
}
