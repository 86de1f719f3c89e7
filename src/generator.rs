use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::GenerationError;

/// Produces the automated reply for one inbound message.
///
/// Callers invoke this at most once per inbound message and never retry.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, user_text: &str, context: &str) -> Result<String, GenerationError>;
}

/// Used when no provider is configured; every call is unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGenerator;

#[async_trait]
impl ResponseGenerator for DisabledGenerator {
    async fn generate(&self, _user_text: &str, _context: &str) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable(
            "OPENAI_API_KEY not configured".to_string(),
        ))
    }
}

/// OpenAI chat completions client.
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiGenerator {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiGenerator {
    async fn generate(&self, user_text: &str, context: &str) -> Result<String, GenerationError> {
        if self.api_key.trim().is_empty() {
            return Err(GenerationError::Unavailable(
                "OPENAI_API_KEY not configured".to_string(),
            ));
        }
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": context },
                    { "role": "user", "content": user_text }
                ]
            }))
            .send()
            .await
            .map_err(|err| GenerationError::Unavailable(format!("openai request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::Unavailable(format!(
                "openai returned {status}: {body}"
            )));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| GenerationError::Unavailable(format!("openai parse failed: {err}")))?;
        completion_text(&payload).ok_or_else(|| {
            GenerationError::Unavailable("openai response had empty content".to_string())
        })
    }
}

fn completion_text(payload: &Value) -> Option<String> {
    payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_text_reads_first_choice() {
        let payload = json!({
            "choices": [
                { "message": { "role": "assistant", "content": "  Hola!  " } },
                { "message": { "role": "assistant", "content": "ignored" } }
            ]
        });
        assert_eq!(completion_text(&payload).as_deref(), Some("Hola!"));
    }

    #[test]
    fn completion_text_rejects_blank_or_missing_content() {
        assert_eq!(completion_text(&json!({ "choices": [] })), None);
        assert_eq!(
            completion_text(&json!({ "choices": [{ "message": { "content": "  " } }] })),
            None
        );
    }

    #[tokio::test]
    async fn missing_key_is_unavailable_without_a_request() {
        let generator = OpenAiGenerator::new(reqwest::Client::new(), "", "gpt-4o")
            .with_endpoint("http://127.0.0.1:9/unreachable");
        let err = generator.generate("Hola", "ctx").await.unwrap_err();
        assert!(matches!(err, GenerationError::Unavailable(_)));
    }

    #[tokio::test]
    async fn disabled_generator_always_fails() {
        let err = DisabledGenerator.generate("Hola", "ctx").await.unwrap_err();
        assert!(matches!(err, GenerationError::Unavailable(_)));
    }
}
