use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use ds_core::ErrorKind;

use crate::repair::repair_and_parse;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur when interacting with a chat provider.
#[derive(Debug, Error)]
pub enum ChatError {
    /// An HTTP-level error (connection failure, DNS, TLS, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The API returned a non-success status with a message.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Failed to parse the API response body.
    #[error("parse error: {0}")]
    Parse(String),

    /// The API indicated rate limiting (HTTP 429).
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// A strict-JSON task returned unrepairable output.
    #[error("invalid JSON output: {0}")]
    InvalidJson(String),
}

impl ChatError {
    /// Map into the engine-wide error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Http(_) | ChatError::Api { .. } => ErrorKind::UpstreamUnavailable,
            ChatError::RateLimited { .. } => ErrorKind::UpstreamRateLimited,
            ChatError::Timeout => ErrorKind::Timeout,
            ChatError::Parse(_) | ChatError::InvalidJson(_) => ErrorKind::LlmInvalidResponse,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::Timeout
        } else {
            ChatError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

/// Role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// One completion request.
///
/// `task` is a stable routing tag ("github_roast", "scholar_summary", …)
/// used for per-task timeout configuration and logging.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub task: String,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    pub fn new(task: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            task: task.into(),
            messages,
            model: "google/gemini-2.5-flash-lite".to_string(),
            temperature: 0.4,
            max_tokens: 1024,
            timeout: None,
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response from a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

/// Tagged provider payloads as seen by card handlers.
#[derive(Debug, Clone)]
pub enum ChatResult {
    Text(String),
    Json(Value),
}

// ---------------------------------------------------------------------------
// ChatProvider trait
// ---------------------------------------------------------------------------

/// Async trait for chat providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a completion request and return the full response.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse, ChatError>;

    /// Strict-JSON completion: the repaired, parsed object or
    /// [`ChatError::InvalidJson`]. Repair happens here, at the provider
    /// boundary, so callers never see raw fenced output.
    async fn complete_json(&self, request: &ChatRequest) -> Result<Value, ChatError> {
        let response = self.complete(request).await?;
        repair_and_parse(&response.content)
            .ok_or_else(|| ChatError::InvalidJson(truncate(&response.content, 200)))
    }

    /// Stream a completion through a synchronous chunk callback, returning
    /// the full response at the end.
    ///
    /// The default implementation pseudo-streams: it performs a non-stream
    /// request and chunks the finished text through the callback. Provider
    /// streaming can have large and unstable time-to-first-byte in
    /// production; pseudo-streaming keeps delta pacing predictable.
    async fn stream(
        &self,
        request: &ChatRequest,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<ChatResponse, ChatError> {
        let response = self.complete(request).await?;
        let text = response.content.clone();
        let mut start = 0;
        while start < text.len() {
            let mut end = (start + 120).min(text.len());
            while !text.is_char_boundary(end) {
                end += 1;
            }
            on_delta(&text[start..end]);
            start = end;
        }
        Ok(response)
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_constructors() {
        let s = ChatMessage::system("sys");
        assert_eq!(s.role, ChatRole::System);
        let u = ChatMessage::user("usr");
        assert_eq!(u.role, ChatRole::User);
        let a = ChatMessage::assistant("ast");
        assert_eq!(a.role, ChatRole::Assistant);
    }

    #[test]
    fn request_builder_chains() {
        let req = ChatRequest::new("github_best_pr", vec![ChatMessage::user("hi")])
            .model("test-model")
            .temperature(0.2)
            .max_tokens(260)
            .timeout(Duration::from_secs(9));
        assert_eq!(req.task, "github_best_pr");
        assert_eq!(req.model, "test-model");
        assert_eq!(req.max_tokens, 260);
        assert_eq!(req.timeout, Some(Duration::from_secs(9)));
    }

    #[test]
    fn error_kinds_map_to_taxonomy() {
        assert_eq!(
            ChatError::Http("refused".into()).kind(),
            ErrorKind::UpstreamUnavailable
        );
        assert_eq!(
            ChatError::RateLimited {
                retry_after_secs: Some(3)
            }
            .kind(),
            ErrorKind::UpstreamRateLimited
        );
        assert_eq!(ChatError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            ChatError::InvalidJson("nope".into()).kind(),
            ErrorKind::LlmInvalidResponse
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld, this is a long line";
        let cut = truncate(text, 10);
        assert!(cut.chars().count() <= 12);
    }
}
