use std::time::Duration;

use thiserror::Error;

/// Failures of the persistence layer. Idempotency hits are not errors; see
/// [`crate::store::AppendOutcome`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conversation '{id}' is closed")]
    InvalidTransition { id: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("response generation unavailable: {0}")]
    Unavailable(String),

    #[error("response generation timed out after {0:?}")]
    TimedOut(Duration),
}

/// Rejections raised while turning a webhook body into inbound events.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid webhook signature")]
    InvalidSignature,
}

#[derive(Debug, Error)]
pub enum IngestError {
    /// The inbound message was not stored; the provider should redeliver.
    #[error("inbound message not persisted: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery not configured")]
    NotConfigured,

    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("platform returned {status}: {body}")]
    Rejected { status: u16, body: String },
}
