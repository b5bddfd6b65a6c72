//! Thin client for the Anthropic Messages API.
//!
//! Shared by the generator, validator and analyzer. Callers supply the system
//! and user prompts; this module handles the request envelope, extraction of
//! the reply text and decoding of the JSON object the prompts ask for.

use crate::error::LlmError;
use crate::http_client::HttpClient;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";

const MAX_TOKENS: u32 = 1500;

pub struct ClaudeClient {
    http: Arc<dyn HttpClient>,
    api_key: Option<String>,
    model: String,
}

impl ClaudeClient {
    pub fn new(http: Arc<dyn HttpClient>, api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_key,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Sends one exchange and returns the text of the first content block.
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let api_key = self.api_key.as_deref().ok_or(LlmError::MissingApiKey)?;

        let request_body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": system,
            "messages": [
                {
                    "role": "user",
                    "content": prompt
                }
            ]
        });

        let headers = [
            ("x-api-key", api_key),
            ("content-type", "application/json"),
            ("anthropic-version", ANTHROPIC_VERSION),
        ];

        info!("Calling Claude API ({})", self.model);
        let response_text = self
            .http
            .post_json(MESSAGES_URL, &headers, &request_body)
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        debug!("Claude API response: {}", response_text);

        extract_text(&response_text)
    }
}

fn extract_text(response_text: &str) -> Result<String, LlmError> {
    let response: serde_json::Value = serde_json::from_str(response_text)
        .map_err(|e| LlmError::MalformedReply(format!("response is not JSON: {}", e)))?;

    if let Some(message) = response.pointer("/error/message").and_then(|m| m.as_str()) {
        return Err(LlmError::Transport(message.to_string()));
    }

    response
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|item| item.get("text"))
        .and_then(|text| text.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            warn!("Failed to extract content from Claude response");
            LlmError::MalformedReply("response has no text content".to_string())
        })
}

/// Decodes a JSON object from model output, tolerating a Markdown code fence
/// or prose around the object.
pub fn parse_json_reply<T: DeserializeOwned>(text: &str) -> Result<T, LlmError> {
    let candidate = json_object_slice(text).unwrap_or(text.trim());
    serde_json::from_str(candidate).map_err(|e| {
        warn!("Failed to parse model reply as JSON: {}", text);
        LlmError::MalformedReply(e.to_string())
    })
}

fn json_object_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::testing::MockHttpClient;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        command: String,
    }

    fn api_reply(text: &str) -> String {
        json!({ "content": [{ "type": "text", "text": text }] }).to_string()
    }

    #[tokio::test]
    async fn test_complete_extracts_first_text_block() {
        let http = Arc::new(MockHttpClient::new(&api_reply("hello")));
        let client = ClaudeClient::new(http.clone(), Some("sk-test".to_string()), DEFAULT_MODEL);

        let text = client.complete("system", "prompt").await.unwrap();

        assert_eq!(text, "hello");
        let body = http.last_request().unwrap();
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["system"], "system");
        assert_eq!(body["messages"][0]["content"], "prompt");
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_without_request() {
        let http = Arc::new(MockHttpClient::new(&api_reply("unused")));
        let client = ClaudeClient::new(http.clone(), None, DEFAULT_MODEL);

        let err = client.complete("s", "p").await.unwrap_err();

        assert!(matches!(err, LlmError::MissingApiKey));
        assert_eq!(http.request_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported() {
        let http = Arc::new(MockHttpClient::failing("connection refused"));
        let client = ClaudeClient::new(http, Some("k".to_string()), DEFAULT_MODEL);

        let err = client.complete("s", "p").await.unwrap_err();
        assert!(matches!(err, LlmError::Transport(ref m) if m.contains("connection refused")));
    }

    #[tokio::test]
    async fn test_api_error_body_is_transport_error() {
        let body = json!({ "type": "error", "error": { "type": "overloaded_error", "message": "Overloaded" } });
        let http = Arc::new(MockHttpClient::new(&body.to_string()));
        let client = ClaudeClient::new(http, Some("k".to_string()), DEFAULT_MODEL);

        let err = client.complete("s", "p").await.unwrap_err();
        assert!(matches!(err, LlmError::Transport(ref m) if m == "Overloaded"));
    }

    #[tokio::test]
    async fn test_completion_text_decodes_as_json_reply() {
        let http = Arc::new(MockHttpClient::new(&api_reply(r#"{"command": "ls"}"#)));
        let client = ClaudeClient::new(http, Some("k".to_string()), DEFAULT_MODEL);

        let text = client.complete("s", "p").await.unwrap();
        let reply: Reply = parse_json_reply(&text).unwrap();
        assert_eq!(reply.command, "ls");
    }

    #[test]
    fn test_parse_json_reply_strips_code_fence() {
        let text = "```json\n{\"command\": \"Get-Date\"}\n```";
        let reply: Reply = parse_json_reply(text).unwrap();
        assert_eq!(reply.command, "Get-Date");
    }

    #[test]
    fn test_parse_json_reply_rejects_prose() {
        let err = parse_json_reply::<Reply>("I cannot help with that.").unwrap_err();
        assert!(matches!(err, LlmError::MalformedReply(_)));
    }
}
