use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    broadcast::Broadcaster,
    config::{Config, StoreKind},
    delivery::{NoopSender, PlatformSender, WhatsAppCloudSender},
    error::{IngestError, StoreError, WebhookError},
    generator::{DisabledGenerator, OpenAiGenerator, ResponseGenerator},
    handoff::KeywordHandoff,
    ingest::{post_agent_message, toggle_bot, IngestController, PromptSettings},
    store::{MemoryStore, PgStore, Store},
    types::{
        now_iso, AgentMessageBody, AppState, ConversationWithMessages, ToggleBotBody,
    },
    webhook::{parse_webhook, verify_signature, verify_subscription, Verification},
};

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Wires the shared state from already-built collaborators. `run` picks the
/// production ones; tests pass in-memory stores and scripted generators.
pub fn build_state(
    config: Arc<Config>,
    store: Arc<dyn Store>,
    generator: Arc<dyn ResponseGenerator>,
    delivery: Arc<dyn PlatformSender>,
) -> Arc<AppState> {
    let broadcaster = Broadcaster::new();
    let ingest = IngestController::new(store.clone(), broadcaster.clone(), generator)
        .with_policy(Arc::new(KeywordHandoff::new(&config.handover_keywords)))
        .with_delivery(delivery.clone())
        .with_prompt(PromptSettings {
            business_name: config.business_name.clone(),
            bot_persona: config.bot_persona.clone(),
        })
        .with_generation_timeout(config.ai_timeout);

    Arc::new(AppState {
        store,
        broadcaster,
        ingest,
        delivery,
        config,
    })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .route("/events", get(events))
        .route("/conversations", get(list_conversations))
        .route("/conversations/{conversation_id}", get(get_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            get(get_messages).post(post_message),
        )
        .route("/conversations/{conversation_id}/bot", patch(patch_bot))
        .route("/contacts", get(list_contacts))
        .route("/contacts/{contact_id}", get(get_contact))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn default_generator(config: &Config, client: reqwest::Client) -> Arc<dyn ResponseGenerator> {
    if config.openai_api_key.trim().is_empty() {
        tracing::warn!("OPENAI_API_KEY not set, automated replies disabled");
        return Arc::new(DisabledGenerator);
    }
    Arc::new(OpenAiGenerator::new(
        client,
        config.openai_api_key.clone(),
        config.openai_model.clone(),
    ))
}

fn default_delivery(config: &Config, client: reqwest::Client) -> Arc<dyn PlatformSender> {
    if config.whatsapp_access_token.is_empty() || config.whatsapp_phone_number_id.is_empty() {
        tracing::info!("whatsapp cloud credentials not set, outbound delivery disabled");
        return Arc::new(NoopSender);
    }
    Arc::new(WhatsAppCloudSender::new(
        client,
        config.whatsapp_access_token.clone(),
        config.whatsapp_phone_number_id.clone(),
    ))
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match config.store {
        StoreKind::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&config.database_url)
                .await
                .context("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)")?;
            let store = PgStore::new(pool);
            store.migrate().await.context("failed to run sqlx migrations")?;
            Ok(Arc::new(store))
        }
        StoreKind::Memory => {
            tracing::warn!("STORE=memory: data is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);
    if config.app_secret.is_empty() {
        tracing::warn!("META_APP_SECRET not set, webhook signatures are not checked");
    }

    let store = open_store(&config).await?;
    let client = reqwest::Client::new();
    let generator = default_generator(&config, client.clone());
    let delivery = default_delivery(&config, client);
    let state = build_state(config.clone(), store, generator, delivery);
    let broadcaster = state.broadcaster.clone();
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(port = config.port, "inbox relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broadcaster))
        .await
        .context("server runtime failure")?;
    Ok(())
}

// Open SSE streams would hold graceful shutdown forever; closing the
// broadcaster ends them.
async fn shutdown_signal(broadcaster: Broadcaster) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
    broadcaster.shutdown();
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound { .. } => error_response(StatusCode::NOT_FOUND, err.to_string()),
        StoreError::InvalidTransition { .. } => {
            error_response(StatusCode::CONFLICT, err.to_string())
        }
        err => {
            tracing::error!(error = %err, "store request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match verify_subscription(&params, &state.config.verify_token) {
        Verification::Accepted(challenge) => (StatusCode::OK, challenge).into_response(),
        Verification::Forbidden => {
            tracing::warn!("webhook verification rejected");
            error_response(StatusCode::FORBIDDEN, "invalid webhook verification token")
        }
        Verification::MissingParams => {
            error_response(StatusCode::BAD_REQUEST, "missing hub.mode or hub.verify_token")
        }
    }
}

async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_signature(&state.config.app_secret, signature_header, &body) {
        tracing::warn!("rejected webhook with invalid signature");
        return error_response(
            StatusCode::UNAUTHORIZED,
            WebhookError::InvalidSignature.to_string(),
        );
    }

    let events = match parse_webhook(&body) {
        Ok(events) => events,
        Err(err) => {
            tracing::warn!(error = %err, "rejected webhook payload");
            return error_response(StatusCode::BAD_REQUEST, err.to_string());
        }
    };

    let mut processed = 0usize;
    let mut duplicates = 0usize;
    let mut lost = 0usize;
    for event in &events {
        match state.ingest.ingest(event).await {
            Ok(outcome) if outcome.duplicate => duplicates += 1,
            Ok(_) => processed += 1,
            Err(IngestError::Persistence(err)) => {
                tracing::error!(
                    platform = %event.platform,
                    event_id = event.platform_message_id.as_deref().unwrap_or("-"),
                    error = %err,
                    "inbound message not persisted"
                );
                lost += 1;
            }
        }
    }

    if lost > 0 {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{lost} inbound message(s) not persisted, retry later"),
        );
    }
    Json(json!({
        "received": true,
        "processed": processed,
        "duplicates": duplicates
    }))
    .into_response()
}

async fn events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.broadcaster.subscribe();
    tracing::debug!(client_id = subscription.id(), "sse stream opened");
    let stream = subscription
        .map(|frame| Ok::<_, Infallible>(Event::default().event(frame.event).data(frame.data)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

async fn list_conversations(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_conversations().await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn get_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let conversation = match state.store.get_conversation(&conversation_id).await {
        Ok(conversation) => conversation,
        Err(err) => return store_error_response(err),
    };
    match state.store.list_messages(&conversation_id).await {
        Ok(messages) => Json(ConversationWithMessages {
            conversation,
            messages,
        })
        .into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn get_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(err) = state.store.get_conversation(&conversation_id).await {
        return store_error_response(err);
    }
    match state.store.list_messages(&conversation_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn post_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AgentMessageBody>,
) -> Response {
    let content = body.content.trim();
    if content.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "content is required");
    }
    match post_agent_message(
        state.store.as_ref(),
        &state.broadcaster,
        state.delivery.clone(),
        &conversation_id,
        content,
    )
    .await
    {
        Ok(message) => (StatusCode::CREATED, Json(message)).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn patch_bot(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ToggleBotBody>,
) -> Response {
    match toggle_bot(state.store.as_ref(), &conversation_id, body.bot_enabled).await {
        Ok(conversation) => {
            tracing::info!(
                %conversation_id,
                bot_enabled = conversation.bot_enabled,
                status = %conversation.status.as_str(),
                "bot toggled"
            );
            Json(conversation).into_response()
        }
        Err(err) => store_error_response(err),
    }
}

async fn list_contacts(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_contacts().await {
        Ok(contacts) => Json(contacts).into_response(),
        Err(err) => store_error_response(err),
    }
}

async fn get_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.store.get_contact(&contact_id).await {
        Ok(contact) => Json(contact).into_response(),
        Err(err) => store_error_response(err),
    }
}
