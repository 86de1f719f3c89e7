//! Turns provider webhook bodies into validated [`InboundEvent`]s.
//!
//! Two shapes are accepted: the flattened event used by internal relays and
//! test tooling, and the Meta envelope sent by the WhatsApp Cloud API
//! (`changes[].value.messages`) and by Messenger/Instagram (`messaging[]`).

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::{
    error::WebhookError,
    types::{InboundEvent, Platform},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatEvent {
    external_id: String,
    platform: String,
    text: String,
    #[serde(default)]
    platform_message_id: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetaEnvelope {
    object: String,
    #[serde(default)]
    entry: Vec<MetaEntry>,
}

#[derive(Debug, Deserialize)]
struct MetaEntry {
    #[serde(default)]
    changes: Vec<MetaChange>,
    #[serde(default)]
    messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Deserialize)]
struct MetaChange {
    #[serde(default)]
    value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    contacts: Vec<WaContact>,
    #[serde(default)]
    messages: Vec<WaMessage>,
}

#[derive(Debug, Deserialize)]
struct WaContact {
    wa_id: String,
    #[serde(default)]
    profile: Option<WaProfile>,
}

#[derive(Debug, Deserialize)]
struct WaProfile {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaMessage {
    from: String,
    id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<WaText>,
}

#[derive(Debug, Deserialize)]
struct WaText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct MessagingEvent {
    sender: MessagingParty,
    #[serde(default)]
    message: Option<MessagingMessage>,
}

#[derive(Debug, Deserialize)]
struct MessagingParty {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessagingMessage {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
}

fn malformed(reason: impl Into<String>) -> WebhookError {
    WebhookError::MalformedPayload(reason.into())
}

/// Keeps message text as sent; only all-whitespace text is dropped.
fn non_blank_text(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Digits only; WhatsApp ids arrive both as `+57...` and `57...`.
pub fn normalize_whatsapp_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn normalize_external_id(platform: Platform, raw: &str) -> Option<String> {
    match platform {
        Platform::Whatsapp => normalize_whatsapp_phone(raw),
        _ => non_blank(Some(raw.to_string())),
    }
}

/// Parses a webhook body into zero or more inbound events. An empty list
/// means the body was well formed but carried nothing to ingest (status
/// updates, media, echoes).
pub fn parse_webhook(body: &[u8]) -> Result<Vec<InboundEvent>, WebhookError> {
    let value = serde_json::from_slice::<Value>(body)
        .map_err(|err| malformed(format!("body is not JSON: {err}")))?;
    if !value.is_object() {
        return Err(malformed("body is not a JSON object"));
    }

    if value.get("object").is_some() {
        let envelope = serde_json::from_value::<MetaEnvelope>(value)
            .map_err(|err| malformed(format!("invalid envelope: {err}")))?;
        return parse_envelope(envelope);
    }

    let flat = serde_json::from_value::<FlatEvent>(value)
        .map_err(|err| malformed(format!("invalid event: {err}")))?;
    parse_flat(flat).map(|event| vec![event])
}

fn parse_flat(flat: FlatEvent) -> Result<InboundEvent, WebhookError> {
    let platform = flat
        .platform
        .parse::<Platform>()
        .map_err(WebhookError::MalformedPayload)?;
    let external_id = normalize_external_id(platform, &flat.external_id)
        .ok_or_else(|| malformed("externalId is empty"))?;
    let Some(text) = non_blank_text(Some(flat.text)) else {
        return Err(malformed("text is empty"));
    };
    Ok(InboundEvent {
        platform,
        external_id,
        text,
        platform_message_id: non_blank(flat.platform_message_id),
        display_name: non_blank(flat.display_name),
    })
}

fn envelope_platform(object: &str) -> Result<Platform, WebhookError> {
    match object {
        "whatsapp_business_account" => Ok(Platform::Whatsapp),
        "instagram" => Ok(Platform::Instagram),
        "page" => Ok(Platform::Facebook),
        other => Err(malformed(format!("unsupported object '{other}'"))),
    }
}

fn parse_envelope(envelope: MetaEnvelope) -> Result<Vec<InboundEvent>, WebhookError> {
    let platform = envelope_platform(&envelope.object)?;
    let mut events = Vec::new();

    for entry in envelope.entry {
        for change in entry.changes {
            let profile_names = change
                .value
                .contacts
                .iter()
                .filter_map(|contact| {
                    let digits = normalize_whatsapp_phone(&contact.wa_id)?;
                    let name = non_blank(contact.profile.as_ref()?.name.clone())?;
                    Some((digits, name))
                })
                .collect::<HashMap<_, _>>();

            for message in change.value.messages {
                if message.kind != "text" {
                    tracing::debug!(kind = %message.kind, "skipping non-text message");
                    continue;
                }
                let Some(text) = non_blank_text(message.text.map(|t| t.body)) else {
                    continue;
                };
                let Some(external_id) = normalize_external_id(platform, &message.from) else {
                    continue;
                };
                events.push(InboundEvent {
                    platform,
                    display_name: profile_names.get(&external_id).cloned(),
                    external_id,
                    text,
                    platform_message_id: non_blank(Some(message.id)),
                });
            }
        }

        for event in entry.messaging {
            let Some(message) = event.message else {
                continue;
            };
            if message.is_echo {
                continue;
            }
            let Some(text) = non_blank_text(message.text) else {
                continue;
            };
            let Some(external_id) = normalize_external_id(platform, &event.sender.id) else {
                continue;
            };
            events.push(InboundEvent {
                platform,
                external_id,
                text,
                platform_message_id: non_blank(message.mid),
                display_name: None,
            });
        }
    }

    Ok(events)
}

/// Checks `X-Hub-Signature-256` against the raw body. An empty secret
/// disables the check.
pub fn verify_signature(app_secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    if app_secret.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

#[derive(Debug, PartialEq, Eq)]
pub enum Verification {
    Accepted(String),
    Forbidden,
    MissingParams,
}

/// Meta subscription handshake (`hub.mode`, `hub.verify_token`, `hub.challenge`).
pub fn verify_subscription(params: &HashMap<String, String>, expected_token: &str) -> Verification {
    let (Some(mode), Some(token)) = (params.get("hub.mode"), params.get("hub.verify_token")) else {
        return Verification::MissingParams;
    };
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    if mode == "subscribe" && !expected_token.is_empty() && token == expected_token {
        Verification::Accepted(challenge)
    } else {
        Verification::Forbidden
    }
}
