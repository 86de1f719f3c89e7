//! Inbound message pipeline: contact, conversation, log, broadcast, then
//! either an automated reply or a hand-over to a human agent.
//!
//! Everything up to and including storing the inbound message may fail the
//! request so the provider redelivers. Everything after it is logged and
//! absorbed: the message is safe and a redelivery would only be deduplicated.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::json;

use crate::{
    broadcast::Broadcaster,
    delivery::{spawn_delivery, NoopSender, PlatformSender},
    error::{GenerationError, IngestError, StoreError},
    generator::ResponseGenerator,
    handoff::{Decision, HandoffPolicy, KeywordHandoff},
    prompting::{render_system_prompt, render_transcript, SystemPromptContext},
    store::{AppendOutcome, Store},
    types::{ChatMessage, Contact, Conversation, ConversationStatus, InboundEvent, MessageRole},
};

pub const NEW_MESSAGE_EVENT: &str = "new_message";
pub const HANDOVER_NOTICE: &str = "Agent requested. AI paused.";
const CONTEXT_MESSAGES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestAction {
    /// Already stored under the same platform message id; nothing was redone.
    Duplicate,
    /// Conversation is human-owned.
    BotDisabled,
    HandedOver,
    Replied,
    /// Generator unavailable, failed or timed out.
    ReplySkipped,
    /// A step after persistence failed; see logs.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub conversation_id: String,
    pub message_id: String,
    pub duplicate: bool,
    pub action: IngestAction,
}

#[derive(Debug, Clone, Default)]
pub struct PromptSettings {
    pub business_name: String,
    pub bot_persona: String,
}

pub struct IngestController {
    store: Arc<dyn Store>,
    broadcaster: Broadcaster,
    policy: Arc<dyn HandoffPolicy>,
    generator: Arc<dyn ResponseGenerator>,
    delivery: Arc<dyn PlatformSender>,
    prompt: PromptSettings,
    generation_timeout: Duration,
}

impl IngestController {
    pub fn new(
        store: Arc<dyn Store>,
        broadcaster: Broadcaster,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            policy: Arc::new(KeywordHandoff::default()),
            generator,
            delivery: Arc::new(NoopSender),
            prompt: PromptSettings::default(),
            generation_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn HandoffPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn PlatformSender>) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_prompt(mut self, prompt: PromptSettings) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    /// Runs one inbound event through the pipeline. The generator, when
    /// reached, is awaited inside this call.
    pub async fn ingest(&self, event: &InboundEvent) -> Result<IngestOutcome, IngestError> {
        let event_id = event.platform_message_id.as_deref().unwrap_or("-");

        let contact = self
            .store
            .resolve(
                event.platform,
                &event.external_id,
                event.display_name.as_deref(),
            )
            .await?;
        let conversation = self
            .store
            .get_or_create(&contact.id, event.platform)
            .await?;
        let appended = self
            .store
            .append(
                &conversation.id,
                &event.text,
                MessageRole::User,
                event.platform_message_id.as_deref(),
                None,
            )
            .await?;

        let inbound = match appended {
            AppendOutcome::Duplicate(existing) => {
                tracing::info!(
                    conversation_id = %conversation.id,
                    event_id,
                    "duplicate delivery ignored"
                );
                return Ok(IngestOutcome {
                    conversation_id: conversation.id,
                    message_id: existing.id,
                    duplicate: true,
                    action: IngestAction::Duplicate,
                });
            }
            AppendOutcome::Created(message) => message,
        };

        self.broadcaster.publish(NEW_MESSAGE_EVENT, &inbound);

        let action = self.respond(&contact, &conversation, &inbound).await;
        tracing::info!(
            conversation_id = %conversation.id,
            event_id,
            platform = %event.platform,
            ?action,
            "inbound message processed"
        );
        Ok(IngestOutcome {
            conversation_id: conversation.id,
            message_id: inbound.id,
            duplicate: false,
            action,
        })
    }

    async fn respond(
        &self,
        contact: &Contact,
        conversation: &Conversation,
        inbound: &ChatMessage,
    ) -> IngestAction {
        if !conversation.bot_enabled {
            return IngestAction::BotDisabled;
        }

        match self.policy.decide(&inbound.content, conversation) {
            Decision::Handover => match self.hand_over(&conversation.id).await {
                Ok(()) => IngestAction::HandedOver,
                Err(err) => {
                    tracing::error!(
                        conversation_id = %conversation.id,
                        message_id = %inbound.id,
                        error = %err,
                        "hand-over failed"
                    );
                    IngestAction::Failed
                }
            },
            Decision::Continue => self.reply(contact, conversation, inbound).await,
        }
    }

    async fn hand_over(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.store.set_bot_enabled(conversation_id, false).await?;
        self.store
            .set_status(conversation_id, ConversationStatus::AgentPaused)
            .await?;
        let notice = self
            .store
            .append(
                conversation_id,
                HANDOVER_NOTICE,
                MessageRole::System,
                None,
                Some(json!({ "reason": "handover_keyword" })),
            )
            .await?
            .into_message();
        self.broadcaster.publish(NEW_MESSAGE_EVENT, &notice);
        Ok(())
    }

    async fn reply(
        &self,
        contact: &Contact,
        conversation: &Conversation,
        inbound: &ChatMessage,
    ) -> IngestAction {
        let context = self.context_for(conversation, inbound).await;

        let generated = match tokio::time::timeout(
            self.generation_timeout,
            self.generator.generate(&inbound.content, &context),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GenerationError::TimedOut(self.generation_timeout)),
        };
        let reply = match generated {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    message_id = %inbound.id,
                    error = %err,
                    "no automated reply"
                );
                return IngestAction::ReplySkipped;
            }
        };

        // A hand-over may have landed while the generator was running.
        match self.store.get_conversation(&conversation.id).await {
            Ok(current)
                if current.bot_enabled && current.status == ConversationStatus::Active => {}
            Ok(current) => {
                tracing::info!(
                    conversation_id = %conversation.id,
                    message_id = %inbound.id,
                    status = current.status.as_str(),
                    bot_enabled = current.bot_enabled,
                    "conversation left the bot during generation, reply dropped"
                );
                return IngestAction::BotDisabled;
            }
            Err(err) => {
                tracing::error!(
                    conversation_id = %conversation.id,
                    message_id = %inbound.id,
                    error = %err,
                    "re-reading conversation before reply failed"
                );
                return IngestAction::Failed;
            }
        }

        let appended = self
            .store
            .append(&conversation.id, &reply, MessageRole::Assistant, None, None)
            .await;
        match appended {
            Ok(outcome) => {
                let message = outcome.into_message();
                self.broadcaster.publish(NEW_MESSAGE_EVENT, &message);
                spawn_delivery(
                    self.delivery.clone(),
                    contact.clone(),
                    conversation.id.clone(),
                    message.content,
                );
                IngestAction::Replied
            }
            Err(err) => {
                tracing::error!(
                    conversation_id = %conversation.id,
                    message_id = %inbound.id,
                    error = %err,
                    "storing automated reply failed"
                );
                IngestAction::Failed
            }
        }
    }

    async fn context_for(&self, conversation: &Conversation, inbound: &ChatMessage) -> String {
        let history = match self
            .store
            .list_recent(&conversation.id, CONTEXT_MESSAGES + 1)
            .await
        {
            Ok(messages) => messages
                .into_iter()
                .filter(|m| m.id != inbound.id)
                .collect::<Vec<_>>(),
            Err(err) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    error = %err,
                    "history unavailable for context"
                );
                Vec::new()
            }
        };
        let start = history.len().saturating_sub(CONTEXT_MESSAGES);
        let transcript = render_transcript(&history[start..]);

        render_system_prompt(&SystemPromptContext {
            business_name: &self.prompt.business_name,
            bot_persona: &self.prompt.bot_persona,
            channel: conversation.channel,
            transcript: &transcript,
        })
    }
}

/// Dashboard bot toggle. Re-enabling a paused conversation returns it to
/// `active`; disabling leaves the status alone.
pub async fn toggle_bot(
    store: &dyn Store,
    conversation_id: &str,
    enabled: bool,
) -> Result<Conversation, StoreError> {
    let conversation = store.set_bot_enabled(conversation_id, enabled).await?;
    if enabled && conversation.status == ConversationStatus::AgentPaused {
        return store
            .set_status(conversation_id, ConversationStatus::Active)
            .await;
    }
    Ok(conversation)
}

/// Stores a human agent's message, broadcasts it and hands it to the
/// platform sender.
pub async fn post_agent_message(
    store: &dyn Store,
    broadcaster: &Broadcaster,
    delivery: Arc<dyn PlatformSender>,
    conversation_id: &str,
    content: &str,
) -> Result<ChatMessage, StoreError> {
    let conversation = store.get_conversation(conversation_id).await?;
    let contact = store.get_contact(&conversation.contact_id).await?;
    let message = store
        .append(conversation_id, content, MessageRole::Agent, None, None)
        .await?
        .into_message();
    broadcaster.publish(NEW_MESSAGE_EVENT, &message);
    spawn_delivery(
        delivery,
        contact,
        conversation_id.to_string(),
        message.content.clone(),
    );
    Ok(message)
}
