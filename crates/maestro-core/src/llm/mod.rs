//! Model invocation with quota-aware fallback.
//!
//! The seam is [`ChatTransport`]: "send these messages to backend X using
//! model Y, get back content or a classifiable error". [`ModelRouter`]
//! wraps a transport and keeps a call alive by walking an ordered list of
//! fallback candidates when a backend reports exhaustion; genuine errors
//! propagate immediately.
//!
//! ```text
//! AgentAction ──► ModelRouter ──► ChatTransport (HTTP, or a test double)
//!                      │
//!            candidate lists (config)
//! ```

pub mod agent;
pub mod http;
pub mod router;

pub use agent::AgentAction;
pub use http::{ApiFlavor, BackendEndpoint, HttpChatTransport};
pub use router::{is_quota_error, ModelRouter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }
}

/// Token counts as reported by the backend, when it reports them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

/// Raw reply from a backend transport.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    /// Model that actually answered (backends may normalize the name).
    pub model: String,
    pub usage: Option<TokenUsage>,
}

/// Classifiable transport failure: the HTTP status (when there was a
/// response) plus the backend's message text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

/// Abstract "ask this model a question" operation.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_chat(
        &self,
        backend: &str,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatReply, TransportError>;
}

/// Response returned by the router, annotated for observability: whether a
/// substitution occurred and, if so, which model the caller asked for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    pub backend: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_model: Option<String>,
}
