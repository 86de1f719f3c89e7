use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    error::DeliveryError,
    types::{Contact, Platform},
};

/// Sends outbound text to a contact on their platform.
#[async_trait]
pub trait PlatformSender: Send + Sync {
    async fn send_text(&self, contact: &Contact, text: &str) -> Result<(), DeliveryError>;
}

/// Logs and drops outbound messages. Used when no platform credentials are
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSender;

#[async_trait]
impl PlatformSender for NoopSender {
    async fn send_text(&self, contact: &Contact, _text: &str) -> Result<(), DeliveryError> {
        tracing::debug!(
            contact_id = %contact.id,
            platform = %contact.platform,
            "outbound delivery not configured, skipping"
        );
        Ok(())
    }
}

/// WhatsApp Cloud API sender (`POST /{phone_number_id}/messages`).
#[derive(Clone)]
pub struct WhatsAppCloudSender {
    client: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    graph_base: String,
}

impl WhatsAppCloudSender {
    pub fn new(
        client: reqwest::Client,
        access_token: impl Into<String>,
        phone_number_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            access_token: access_token.into(),
            phone_number_id: phone_number_id.into(),
            graph_base: "https://graph.facebook.com/v21.0".to_string(),
        }
    }
}

pub fn whatsapp_text_payload(to: &str, text: &str) -> Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": text
        }
    })
}

#[async_trait]
impl PlatformSender for WhatsAppCloudSender {
    async fn send_text(&self, contact: &Contact, text: &str) -> Result<(), DeliveryError> {
        if contact.platform != Platform::Whatsapp
            || self.access_token.is_empty()
            || self.phone_number_id.is_empty()
        {
            return Err(DeliveryError::NotConfigured);
        }

        let response = self
            .client
            .post(format!("{}/{}/messages", self.graph_base, self.phone_number_id))
            .bearer_auth(&self.access_token)
            .json(&whatsapp_text_payload(&contact.external_id, text))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body: truncate(&body, 220),
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() > max_chars {
        let cut = normalized.chars().take(max_chars).collect::<String>();
        format!("{cut}...")
    } else {
        normalized
    }
}

/// Fire-and-forget delivery; failures are logged and never reach the caller.
pub fn spawn_delivery(
    sender: Arc<dyn PlatformSender>,
    contact: Contact,
    conversation_id: String,
    text: String,
) {
    tokio::spawn(async move {
        match sender.send_text(&contact, &text).await {
            Ok(()) => {
                tracing::debug!(%conversation_id, contact_id = %contact.id, "outbound delivered");
            }
            Err(DeliveryError::NotConfigured) => {
                tracing::debug!(
                    %conversation_id,
                    platform = %contact.platform,
                    "no outbound sender for platform"
                );
            }
            Err(err) => {
                tracing::warn!(%conversation_id, error = %err, "outbound delivery failed");
            }
        }
    });
}
