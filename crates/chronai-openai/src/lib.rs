//! chronai-openai: outbound chat-completion client.
//!
//! Sends one user message to an OpenAI-compatible endpoint and returns a
//! bounded summary of the reply. Transport failures are retried with
//! exponential backoff; HTTP error statuses and malformed responses are
//! classified failures surfaced to the execution runner, never retried.

use std::time::{Duration, Instant};

use serde_json::{Value, json};

/// Model used when a task does not name one.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Response summaries and error details are bounded to this many characters.
pub const SUMMARY_LIMIT: usize = 500;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// A classified call failure: a message plus the HTTP status code when one
/// was received (network failures carry none).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ChatCallError {
    pub message: String,
    pub status_code: Option<u16>,
}

impl ChatCallError {
    fn network(message: String) -> Self {
        Self {
            message,
            status_code: None,
        }
    }

    fn http(status: u16, message: String) -> Self {
        Self {
            message,
            status_code: Some(status),
        }
    }
}

/// Successful call result: bounded summary plus wall-clock time of the
/// whole call in milliseconds, retries included.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub summary: String,
    pub elapsed_ms: u64,
}

/// HTTP client for chat-completion endpoints.
pub struct ChatClient {
    client: reqwest::Client,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl ChatClient {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(60))
    }

    /// Create with an explicit per-request timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }

    /// Tune the transport retry policy (tests use short backoffs).
    pub fn with_retry(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff_base = backoff_base;
        self
    }

    /// Send one chat-completion request.
    ///
    /// `api_key` arrives already decrypted; it is only ever logged masked.
    pub async fn send_message(
        &self,
        api_endpoint: &str,
        api_key: &str,
        message_content: &str,
        model: Option<&str>,
    ) -> Result<ChatReply, ChatCallError> {
        let model = model.unwrap_or(DEFAULT_MODEL);
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": message_content}],
        });

        tracing::debug!(
            endpoint = %api_endpoint,
            model = %model,
            key = %chronai_security::mask(api_key),
            "sending chat completion"
        );

        let started = Instant::now();

        let mut attempt = 1u32;
        let response = loop {
            let result = self
                .client
                .post(api_endpoint)
                .bearer_auth(api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) => break resp,
                Err(e) if is_transport_error(&e) && attempt < self.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        "chat completion attempt {attempt}/{} failed ({e}), retrying in {delay:?}",
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(ChatCallError::network(format!("Network error: {e}")));
                }
            }
        };

        let status = response.status().as_u16();
        if status >= 400 {
            let detail = response.text().await.unwrap_or_default();
            return Err(ChatCallError::http(
                status,
                format!("API returned {status}: {}", truncate(&detail, SUMMARY_LIMIT)),
            ));
        }

        let payload: Value = response.json().await.map_err(|e| {
            ChatCallError::http(status, format!("Unexpected response structure: {e}"))
        })?;
        let summary =
            extract_summary(&payload).map_err(|message| ChatCallError::http(status, message))?;

        Ok(ChatReply {
            summary,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        exp.min(self.backoff_cap)
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Only connection failures and timeouts are worth retrying; anything the
/// server actually answered is handled at the status/parse layer.
fn is_transport_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout()
}

/// Pull the bounded summary out of a chat-completion response body.
fn extract_summary(payload: &Value) -> Result<String, String> {
    let message = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| "Unexpected response structure: no choices/message".to_string())?;

    match message.get("content") {
        Some(Value::String(content)) => Ok(truncate(content, SUMMARY_LIMIT)),
        _ => {
            // Some gateways answer image generations with null content and
            // an images list on the message.
            let image_count = message
                .get("images")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0);
            if image_count > 0 {
                Ok(format!("[图像生成成功] 共 {image_count} 张图片"))
            } else {
                Err("Response content is null and no images were returned".to_string())
            }
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_KEY: &str = "sk-test1234567890abcdef";

    fn success_body(content: &str) -> Value {
        json!({
            "id": "chatcmpl-test",
            "object": "chat.completion",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }]
        })
    }

    fn fast_client() -> ChatClient {
        ChatClient::with_timeout(Duration::from_millis(200))
            .with_retry(3, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_success_returns_summary_and_elapsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", format!("Bearer {TEST_KEY}")))
            .and(body_partial_json(json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "Hello, AI!"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body("Hi there")))
            .expect(1)
            .mount(&server)
            .await;

        let reply = fast_client()
            .send_message(
                &format!("{}/v1/chat/completions", server.uri()),
                TEST_KEY,
                "Hello, AI!",
                Some("gpt-4"),
            )
            .await
            .unwrap();

        assert_eq!(reply.summary, "Hi there");
    }

    #[tokio::test]
    async fn test_default_model_applied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"model": DEFAULT_MODEL})))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body("ok")))
            .expect(1)
            .mount(&server)
            .await;

        fast_client()
            .send_message(&server.uri(), TEST_KEY, "hi", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_summary_truncated_to_500_chars() {
        let server = MockServer::start().await;
        let long = "字".repeat(700);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body(&long)))
            .mount(&server)
            .await;

        let reply = fast_client()
            .send_message(&server.uri(), TEST_KEY, "hi", None)
            .await
            .unwrap();
        assert_eq!(reply.summary.chars().count(), SUMMARY_LIMIT);
    }

    #[tokio::test]
    async fn test_http_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_string(r#"{"error": "invalid api key"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = fast_client()
            .send_message(&server.uri(), TEST_KEY, "hi", None)
            .await
            .unwrap_err();

        assert_eq!(err.status_code, Some(401));
        assert!(err.message.contains("401"));
        assert!(err.message.contains("invalid api key"));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeouts_retry_then_succeed() {
        let server = MockServer::start().await;
        // Two slow answers trip the client timeout, the third succeeds.
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(success_body("slow")),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body("finally")))
            .mount(&server)
            .await;

        let reply = fast_client()
            .send_message(&server.uri(), TEST_KEY, "hi", None)
            .await
            .unwrap();

        assert_eq!(reply.summary, "finally");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_classified_without_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(success_body("never")),
            )
            .mount(&server)
            .await;

        let err = fast_client()
            .send_message(&server.uri(), TEST_KEY, "hi", None)
            .await
            .unwrap_err();

        assert_eq!(err.status_code, None);
        assert!(err.message.starts_with("Network error"));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let err = ChatClient::with_timeout(Duration::from_millis(200))
            .with_retry(2, Duration::from_millis(1))
            .send_message("http://127.0.0.1:1/v1/chat/completions", TEST_KEY, "hi", None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code, None);
    }

    #[tokio::test]
    async fn test_null_content_with_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "images": [{"url": "https://img/1"}, {"url": "https://img/2"}]
                    }
                }]
            })))
            .mount(&server)
            .await;

        let reply = fast_client()
            .send_message(&server.uri(), TEST_KEY, "draw", None)
            .await
            .unwrap();
        assert_eq!(reply.summary, "[图像生成成功] 共 2 张图片");
    }

    #[tokio::test]
    async fn test_null_content_without_images_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": null}}]
            })))
            .mount(&server)
            .await;

        let err = fast_client()
            .send_message(&server.uri(), TEST_KEY, "hi", None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code, Some(200));
        assert!(err.message.contains("no images"));
    }

    #[tokio::test]
    async fn test_missing_choices_is_structure_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"object": "list"})))
            .mount(&server)
            .await;

        let err = fast_client()
            .send_message(&server.uri(), TEST_KEY, "hi", None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code, Some(200));
        assert!(err.message.contains("Unexpected response structure"));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let client = ChatClient::new();
        assert_eq!(client.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(client.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(client.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(client.backoff_delay(4), Duration::from_secs(10));
        assert_eq!(client.backoff_delay(9), Duration::from_secs(10));
    }
}
