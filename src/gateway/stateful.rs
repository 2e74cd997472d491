//! Adapter for the stateful `/api/v1/chat` conversation endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;

use super::error::{ErrorContext, ProviderError, StatusKind};
use super::stream::{blocks_from_result, SseAccumulator};
use super::types::*;

// =============================================================================
// TRAIT
// =============================================================================

/// Trait for single-attempt conversation backends.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

// =============================================================================
// STATEFUL ADAPTER
// =============================================================================

/// Maximum allowed response body length (4MB).
const MAX_RESPONSE_LEN: usize = 4 * 1_024 * 1_024;

pub const DEFAULT_BASE_URL: &str = "http://localhost:1234";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Client for a local or remote stateful chat server.
#[derive(Debug, Clone)]
pub struct StatefulChatAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl StatefulChatAdapter {
    /// Create with default timeout and no token.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(base_url, None, DEFAULT_TIMEOUT)
    }

    /// Create with custom configuration.
    pub fn with_config(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url.into();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = api_token.filter(|t| !t.trim().is_empty()) {
            let auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ProviderError::config("Invalid API token format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/api/v1/chat", self.base_url.trim_end_matches('/'))
    }

    fn transport_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout {
                after: self.timeout,
            }
        } else {
            ProviderError::Transport(err)
        }
    }

    /// Whether an error message blames the previous session id.
    fn mentions_session(msg: &str) -> bool {
        let l = msg.to_lowercase();
        const MARKERS: &[&str] = &[
            "previous_response",
            "response_id",
            "response id",
            "session",
            "conversation",
        ];
        MARKERS.iter().any(|m| l.contains(m))
    }

    fn status_kind(status: u16, chained: bool, message: &str) -> StatusKind {
        match status {
            400 | 404 if chained && Self::mentions_session(message) => StatusKind::SessionRejected,
            404 => StatusKind::NotReady,
            400 | 413 => StatusKind::TooLarge,
            429 => StatusKind::Throttled,
            s if s >= 500 => StatusKind::Backend,
            _ => StatusKind::Refused,
        }
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<&'a str>,
    temperature: f32,
    stream: bool,
    max_output_tokens: u32,
}

/// Pull a human-readable message and code out of an error body.
fn error_message(body: &str) -> (String, Option<String>) {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        match parsed.get("error") {
            Some(Value::String(s)) => return (s.clone(), None),
            Some(Value::Object(obj)) => {
                let message = obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let code = obj.get("code").and_then(Value::as_str).map(str::to_string);
                return (message, code);
            }
            _ => {}
        }
    }
    (body.trim().to_string(), None)
}

fn oversized_body(len: usize) -> ProviderError {
    ProviderError::answer(
        format!("response body of {len} bytes exceeds {MAX_RESPONSE_LEN}"),
        false,
    )
}

fn reported_tokens(result: &Value, pointers: &[&str]) -> Option<u32> {
    pointers
        .iter()
        .find_map(|p| result.pointer(p).and_then(Value::as_u64))
        .map(|v| v.min(u32::MAX as u64) as u32)
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for StatefulChatAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();

        let api_req = ChatApiRequest {
            model: &req.resource,
            input: &req.input,
            previous_response_id: req.previous_response_id.as_deref(),
            temperature: req.temperature,
            stream: req.stream,
            max_output_tokens: req.max_output_tokens,
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();

        if status.is_success() && req.stream {
            let mut acc = SseAccumulator::new();
            let mut total = 0usize;
            while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? {
                total += chunk.len();
                if total > MAX_RESPONSE_LEN {
                    return Err(oversized_body(total));
                }
                acc.push(&chunk);
            }
            let (response_id, blocks) = acc.finish();
            return Ok(ChatResponse {
                response_id,
                blocks,
                input_tokens: None,
                output_tokens: None,
                latency: start.elapsed(),
            });
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? {
            if bytes.len() + chunk.len() > MAX_RESPONSE_LEN {
                return Err(oversized_body(bytes.len() + chunk.len()));
            }
            bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&bytes).to_string();

        if !status.is_success() {
            let (message, code) = error_message(&body);
            let message = if message.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                message
            };
            let kind = Self::status_kind(status.as_u16(), req.is_chained(), &message);
            let ctx = ErrorContext::new(status.as_u16())
                .with_code(code)
                .with_body(&body);
            return Err(ProviderError::status(kind, message, ctx));
        }

        // A 200 with an undecodable body is treated like a dropped connection.
        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| ProviderError::answer(format!("invalid JSON body: {e}"), true))?;

        if let Some(err) = parsed.get("error").filter(|e| !e.is_null()) {
            let message = match err {
                Value::String(s) => s.clone(),
                other => other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            };
            return Err(ProviderError::answer(message, false));
        }

        let response_id = parsed
            .get("response_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(ChatResponse {
            response_id,
            blocks: blocks_from_result(&parsed),
            input_tokens: reported_tokens(&parsed, &["/stats/input_tokens", "/usage/prompt_tokens"]),
            output_tokens: reported_tokens(
                &parsed,
                &["/stats/total_output_tokens", "/usage/completion_tokens"],
            ),
            latency: start.elapsed(),
        })
    }
}
