//! HTTP client abstraction for external API communication.
//!
//! This module provides a trait-based abstraction over HTTP clients, enabling
//! dependency injection and easy mocking in tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Trait for HTTP communication with external APIs.
///
/// This abstraction allows injecting mock HTTP clients for testing without
/// making real network requests.
///
/// # Example
///
/// ```ignore
/// use shellgate::http_client::{HttpClient, ReqwestHttpClient};
///
/// let client = ReqwestHttpClient::new();
/// let response = client.post_json(
///     "https://api.example.com/endpoint",
///     &[("Content-Type", "application/json")],
///     &serde_json::json!({"key": "value"}),
/// ).await?;
/// ```
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with JSON body and returns the response text.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the server answers with a
    /// non-success status, or the response cannot be read.
    async fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &serde_json::Value) -> Result<String>;
}

/// HTTP client implementation using reqwest.
///
/// This is the default production implementation that makes real HTTP requests.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Creates a new HTTP client with default configuration.
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    /// Creates a client whose requests fail after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &serde_json::Value) -> Result<String> {
        let mut request = self.client.post(url);

        for (key, value) in headers {
            request = request.header(*key, *value);
        }

        let response = request.json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(anyhow!("HTTP {}: {}", status, text));
        }
        Ok(text)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Mock HTTP client for testing.
    ///
    /// Replays queued responses in order (the last one repeats) and records
    /// every request body it receives.
    pub struct MockHttpClient {
        responses: Mutex<VecDeque<Result<String, String>>>,
        pub requests: Mutex<Vec<serde_json::Value>>,
    }

    impl MockHttpClient {
        /// Creates a mock client that always returns the given response.
        pub fn new(response: &str) -> Self {
            Self::with_responses(vec![Ok(response.to_string())])
        }

        /// Creates a mock client that always fails with `message`.
        pub fn failing(message: &str) -> Self {
            Self::with_responses(vec![Err(message.to_string())])
        }

        pub fn with_responses(responses: Vec<Result<String, String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub fn last_request(&self) -> Option<serde_json::Value> {
            self.requests.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn post_json(&self, _url: &str, _headers: &[(&str, &str)], body: &serde_json::Value) -> Result<String> {
            self.requests.lock().unwrap().push(body.clone());
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 {
                responses.pop_front()
            } else {
                responses.front().cloned()
            };
            match next {
                Some(Ok(text)) => Ok(text),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Err(anyhow!("no mock response queued")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockHttpClient;
    use super::*;

    #[tokio::test]
    async fn test_mock_http_client_returns_response() {
        let client = MockHttpClient::new("test response");
        let body = serde_json::json!({"key": "value"});
        let response = client.post_json("http://localhost", &[], &body).await.unwrap();
        assert_eq!(response, "test response");
        assert_eq!(client.last_request(), Some(body));
    }

    #[tokio::test]
    async fn test_mock_http_client_replays_in_order() {
        let client = MockHttpClient::with_responses(vec![Err("down".to_string()), Ok("up".to_string())]);
        let body = serde_json::json!({});
        assert!(client.post_json("u", &[], &body).await.is_err());
        assert_eq!(client.post_json("u", &[], &body).await.unwrap(), "up");
        assert_eq!(client.post_json("u", &[], &body).await.unwrap(), "up");
        assert_eq!(client.request_count(), 3);
    }

    #[test]
    fn test_client_with_timeout_builds() {
        assert!(ReqwestHttpClient::with_timeout(Duration::from_secs(5)).is_ok());
    }
}
