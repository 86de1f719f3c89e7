mod common;

use std::{sync::Arc, time::Duration};

use common::{
    next_delivery, whatsapp_event, Breakage, FailingStore, RecordingSender, ScriptedGenerator,
};
use inbox_relay::{
    broadcast::{Broadcaster, Frame},
    error::IngestError,
    ingest::{
        post_agent_message, toggle_bot, IngestAction, IngestController, HANDOVER_NOTICE,
        NEW_MESSAGE_EVENT,
    },
    store::{ContactDirectory, ConversationStore, MemoryStore, MessageLog, Store},
    types::{ConversationStatus, MessageRole},
};
use serde_json::Value;

struct Harness {
    store: Arc<MemoryStore>,
    broadcaster: Broadcaster,
    controller: IngestController,
}

fn harness(generator: Arc<ScriptedGenerator>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Broadcaster::new();
    let controller = IngestController::new(store.clone(), broadcaster.clone(), generator)
        .with_generation_timeout(Duration::from_millis(200));
    Harness {
        store,
        broadcaster,
        controller,
    }
}

fn drain(sub: &mut inbox_relay::broadcast::Subscription) -> Vec<Frame> {
    std::iter::from_fn(|| sub.try_recv()).collect()
}

fn role_of(frame: &Frame) -> String {
    let payload: Value = serde_json::from_str(&frame.data).unwrap();
    payload["role"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn greeting_is_stored_answered_and_broadcast() {
    let generator = ScriptedGenerator::replying("¡Hola! ¿En qué te ayudo?");
    let (sender, mut deliveries) = RecordingSender::new();
    let h = harness(generator.clone());
    let controller = h.controller.with_delivery(sender);
    let mut sub = h.broadcaster.subscribe();

    let outcome = controller
        .ingest(&whatsapp_event("570001", "Hola", Some("wamid.1")))
        .await
        .unwrap();

    assert_eq!(outcome.action, IngestAction::Replied);
    assert_eq!(generator.calls(), 1);

    let contacts = h.store.list_contacts().await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].external_id, "570001");
    assert_eq!(contacts[0].name, "570001");

    let conversation = h.store.get_conversation(&outcome.conversation_id).await.unwrap();
    assert_eq!(conversation.status, ConversationStatus::Active);
    assert!(conversation.bot_enabled);

    let messages = h.store.list_messages(&conversation.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "Hola");
    assert_eq!(messages[0].platform_message_id.as_deref(), Some("wamid.1"));
    assert_eq!(messages[1].role, MessageRole::Assistant);
    assert_eq!(messages[1].content, "¡Hola! ¿En qué te ayudo?");
    assert_eq!(conversation.last_message_at, messages[1].created_at);

    let frames = drain(&mut sub);
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.event == NEW_MESSAGE_EVENT));
    assert_eq!(role_of(&frames[0]), "user");
    assert_eq!(role_of(&frames[1]), "assistant");

    let (to, text) = next_delivery(&mut deliveries).await;
    assert_eq!(to, "570001");
    assert_eq!(text, "¡Hola! ¿En qué te ayudo?");
}

#[tokio::test]
async fn handover_keyword_pauses_the_bot_without_generating() {
    let generator = ScriptedGenerator::replying("unused");
    let h = harness(generator.clone());
    let mut sub = h.broadcaster.subscribe();

    let outcome = h
        .controller
        .ingest(&whatsapp_event("570001", "Quiero hablar con un AGENTE", Some("wamid.2")))
        .await
        .unwrap();

    assert_eq!(outcome.action, IngestAction::HandedOver);
    assert_eq!(generator.calls(), 0);

    let conversation = h.store.get_conversation(&outcome.conversation_id).await.unwrap();
    assert_eq!(conversation.status, ConversationStatus::AgentPaused);
    assert!(!conversation.bot_enabled);

    let messages = h.store.list_messages(&conversation.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, MessageRole::System);
    assert_eq!(messages[1].content, HANDOVER_NOTICE);
    assert_eq!(messages[1].metadata["reason"], "handover_keyword");

    let frames = drain(&mut sub);
    assert_eq!(frames.len(), 2);
    assert_eq!(role_of(&frames[1]), "system");
}

#[tokio::test]
async fn keyword_match_ignores_case() {
    let generator = ScriptedGenerator::replying("unused");
    let h = harness(generator.clone());

    let outcome = h
        .controller
        .ingest(&whatsapp_event("570001", "un agente por favor", None))
        .await
        .unwrap();

    assert_eq!(outcome.action, IngestAction::HandedOver);
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn paused_conversation_only_records_and_broadcasts() {
    let generator = ScriptedGenerator::replying("unused");
    let h = harness(generator.clone());
    h.controller
        .ingest(&whatsapp_event("570001", "AGENTE", Some("wamid.1")))
        .await
        .unwrap();
    let mut sub = h.broadcaster.subscribe();

    let outcome = h
        .controller
        .ingest(&whatsapp_event("570001", "¿hola?", Some("wamid.2")))
        .await
        .unwrap();

    assert_eq!(outcome.action, IngestAction::BotDisabled);
    assert_eq!(generator.calls(), 0);
    let messages = h.store.list_messages(&outcome.conversation_id).await.unwrap();
    assert_eq!(messages.last().unwrap().content, "¿hola?");
    assert_eq!(drain(&mut sub).len(), 1);
}

#[tokio::test]
async fn redelivered_event_is_processed_once() {
    let generator = ScriptedGenerator::replying("Hola");
    let h = harness(generator.clone());
    let mut sub = h.broadcaster.subscribe();
    let event = whatsapp_event("570001", "Hola", Some("wamid.dup"));

    let first = h.controller.ingest(&event).await.unwrap();
    let second = h.controller.ingest(&event).await.unwrap();

    assert_eq!(first.action, IngestAction::Replied);
    assert_eq!(second.action, IngestAction::Duplicate);
    assert_eq!(second.message_id, first.message_id);
    assert_eq!(generator.calls(), 1);

    let messages = h.store.list_messages(&first.conversation_id).await.unwrap();
    let inbound = messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .count();
    assert_eq!(inbound, 1);
    assert_eq!(drain(&mut sub).len(), 2);
}

#[tokio::test]
async fn events_without_message_ids_are_never_deduplicated() {
    let generator = ScriptedGenerator::failing();
    let h = harness(generator);
    let event = whatsapp_event("570001", "Hola", None);

    h.controller.ingest(&event).await.unwrap();
    let second = h.controller.ingest(&event).await.unwrap();

    assert_eq!(second.action, IngestAction::ReplySkipped);
    let messages = h.store.list_messages(&second.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn generator_failure_keeps_the_inbound_message() {
    let generator = ScriptedGenerator::failing();
    let h = harness(generator.clone());
    let mut sub = h.broadcaster.subscribe();

    let outcome = h
        .controller
        .ingest(&whatsapp_event("570001", "Hola", Some("wamid.1")))
        .await
        .unwrap();

    assert_eq!(outcome.action, IngestAction::ReplySkipped);
    assert_eq!(generator.calls(), 1);
    let messages = h.store.list_messages(&outcome.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(drain(&mut sub).len(), 1);

    let conversation = h.store.get_conversation(&outcome.conversation_id).await.unwrap();
    assert_eq!(conversation.status, ConversationStatus::Active);
    assert!(conversation.bot_enabled);
}

#[tokio::test]
async fn slow_generator_is_cut_off() {
    let generator = ScriptedGenerator::hanging();
    let h = harness(generator.clone());

    let started = std::time::Instant::now();
    let outcome = h
        .controller
        .ingest(&whatsapp_event("570001", "Hola", Some("wamid.1")))
        .await
        .unwrap();

    assert_eq!(outcome.action, IngestAction::ReplySkipped);
    assert!(started.elapsed() < Duration::from_secs(5));
    let messages = h.store.list_messages(&outcome.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn context_carries_prior_turns_but_not_the_current_message() {
    let generator = ScriptedGenerator::replying("Claro");
    let h = harness(generator.clone());

    h.controller
        .ingest(&whatsapp_event("570001", "Hola", Some("wamid.1")))
        .await
        .unwrap();
    h.controller
        .ingest(&whatsapp_event("570001", "¿Tienen envíos?", Some("wamid.2")))
        .await
        .unwrap();

    let contexts = generator.contexts();
    assert_eq!(contexts.len(), 2);
    assert!(!contexts[0].contains("user: Hola"));
    assert!(contexts[1].contains("user: Hola\nassistant: Claro"));
    assert!(!contexts[1].contains("¿Tienen envíos?"));
}

#[tokio::test]
async fn concurrent_first_contact_creates_one_contact_and_conversation() {
    let generator = ScriptedGenerator::replying("ok");
    let h = harness(generator);
    let controller = Arc::new(h.controller);

    let tasks = (0..16)
        .map(|n| {
            let controller = controller.clone();
            tokio::spawn(async move {
                let id = format!("wamid.{n}");
                controller
                    .ingest(&whatsapp_event("570001", "Hola", Some(id.as_str())))
                    .await
                    .unwrap()
            })
        })
        .collect::<Vec<_>>();
    let mut conversation_ids = Vec::new();
    for task in tasks {
        conversation_ids.push(task.await.unwrap().conversation_id);
    }

    assert_eq!(h.store.list_contacts().await.unwrap().len(), 1);
    assert_eq!(h.store.list_conversations().await.unwrap().len(), 1);
    conversation_ids.dedup();
    assert_eq!(conversation_ids.len(), 1);

    let messages = h.store.list_messages(&conversation_ids[0]).await.unwrap();
    assert_eq!(messages.len(), 32);
    assert!(messages.windows(2).all(|pair| pair[0].seq < pair[1].seq));
}

#[tokio::test]
async fn same_external_id_on_another_platform_is_another_contact() {
    let generator = ScriptedGenerator::failing();
    let h = harness(generator);
    let mut instagram = whatsapp_event("570001", "Hola", None);
    instagram.platform = inbox_relay::types::Platform::Instagram;

    let a = h
        .controller
        .ingest(&whatsapp_event("570001", "Hola", None))
        .await
        .unwrap();
    let b = h.controller.ingest(&instagram).await.unwrap();

    assert_ne!(a.conversation_id, b.conversation_id);
    assert_eq!(h.store.list_contacts().await.unwrap().len(), 2);
}

#[tokio::test]
async fn re_enabling_the_bot_resumes_replies() {
    let generator = ScriptedGenerator::replying("De vuelta");
    let h = harness(generator.clone());
    let store: &dyn Store = h.store.as_ref();

    let paused = h
        .controller
        .ingest(&whatsapp_event("570001", "AGENTE", Some("wamid.1")))
        .await
        .unwrap();
    let conversation = toggle_bot(store, &paused.conversation_id, true).await.unwrap();
    assert!(conversation.bot_enabled);
    assert_eq!(conversation.status, ConversationStatus::Active);

    let outcome = h
        .controller
        .ingest(&whatsapp_event("570001", "Hola", Some("wamid.2")))
        .await
        .unwrap();
    assert_eq!(outcome.conversation_id, paused.conversation_id);
    assert_eq!(outcome.action, IngestAction::Replied);
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn disabling_the_bot_leaves_status_alone() {
    let h = harness(ScriptedGenerator::failing());
    let outcome = h
        .controller
        .ingest(&whatsapp_event("570001", "Hola", None))
        .await
        .unwrap();

    let conversation = toggle_bot(h.store.as_ref(), &outcome.conversation_id, false)
        .await
        .unwrap();
    assert!(!conversation.bot_enabled);
    assert_eq!(conversation.status, ConversationStatus::Active);
}

#[tokio::test]
async fn agent_message_is_logged_broadcast_and_delivered() {
    let h = harness(ScriptedGenerator::failing());
    let (sender, mut deliveries) = RecordingSender::new();
    let outcome = h
        .controller
        .ingest(&whatsapp_event("570001", "AGENTE", None))
        .await
        .unwrap();
    let mut sub = h.broadcaster.subscribe();

    let message = post_agent_message(
        h.store.as_ref(),
        &h.broadcaster,
        sender,
        &outcome.conversation_id,
        "Hola, soy Laura",
    )
    .await
    .unwrap();

    assert_eq!(message.role, MessageRole::Agent);
    let frames = drain(&mut sub);
    assert_eq!(frames.len(), 1);
    assert_eq!(role_of(&frames[0]), "agent");
    assert_eq!(
        next_delivery(&mut deliveries).await,
        ("570001".to_string(), "Hola, soy Laura".to_string())
    );
}

#[tokio::test]
async fn reply_is_dropped_when_a_handover_lands_during_generation() {
    let generator = ScriptedGenerator::slow("respuesta tardía", Duration::from_millis(300));
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Broadcaster::new();
    let (sender, mut deliveries) = RecordingSender::new();
    let controller = Arc::new(
        IngestController::new(store.clone(), broadcaster.clone(), generator.clone())
            .with_delivery(sender)
            .with_generation_timeout(Duration::from_secs(5)),
    );

    let greeting = tokio::spawn({
        let controller = controller.clone();
        async move {
            controller
                .ingest(&whatsapp_event("570001", "Hola", Some("wamid.1")))
                .await
                .unwrap()
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let handover = controller
        .ingest(&whatsapp_event("570001", "AGENTE", Some("wamid.2")))
        .await
        .unwrap();
    let greeting = greeting.await.unwrap();

    assert_eq!(handover.action, IngestAction::HandedOver);
    assert_eq!(greeting.action, IngestAction::BotDisabled);
    assert_eq!(generator.calls(), 1);

    let messages = store.list_messages(&greeting.conversation_id).await.unwrap();
    assert!(messages.iter().all(|m| m.role != MessageRole::Assistant));
    assert_eq!(messages.last().unwrap().content, HANDOVER_NOTICE);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(deliveries.try_recv().is_err());
}

#[tokio::test]
async fn inbound_store_failure_is_reported_for_redelivery() {
    let generator = ScriptedGenerator::replying("unused");
    let store = FailingStore::new(Breakage::Append(MessageRole::User));
    let broadcaster = Broadcaster::new();
    let controller = IngestController::new(store, broadcaster.clone(), generator.clone());
    let mut sub = broadcaster.subscribe();

    let result = controller
        .ingest(&whatsapp_event("570001", "Hola", Some("wamid.1")))
        .await;

    assert!(matches!(result, Err(IngestError::Persistence(_))));
    assert_eq!(generator.calls(), 0);
    assert!(drain(&mut sub).is_empty());
}

#[tokio::test]
async fn reply_store_failure_keeps_the_inbound_message() {
    let generator = ScriptedGenerator::replying("Hola");
    let store = FailingStore::new(Breakage::Append(MessageRole::Assistant));
    let broadcaster = Broadcaster::new();
    let controller = IngestController::new(store.clone(), broadcaster.clone(), generator.clone());
    let mut sub = broadcaster.subscribe();

    let outcome = controller
        .ingest(&whatsapp_event("570001", "Hola", Some("wamid.1")))
        .await
        .unwrap();

    assert_eq!(outcome.action, IngestAction::Failed);
    assert_eq!(generator.calls(), 1);
    let messages = store.list_messages(&outcome.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(drain(&mut sub).len(), 1);
}

#[tokio::test]
async fn handover_store_failure_is_absorbed() {
    let generator = ScriptedGenerator::replying("unused");
    let store = FailingStore::new(Breakage::SetStatus);
    let controller = IngestController::new(store.clone(), Broadcaster::new(), generator.clone());

    let outcome = controller
        .ingest(&whatsapp_event("570001", "AGENTE", Some("wamid.1")))
        .await
        .unwrap();

    assert_eq!(outcome.action, IngestAction::Failed);
    assert_eq!(generator.calls(), 0);
    let messages = store.list_messages(&outcome.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 1);
}
