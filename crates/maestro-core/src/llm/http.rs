//! HTTP chat transport — speaks the Anthropic messages flavor and the
//! OpenAI chat-completions flavor.
//!
//! Endpoint descriptions (base URL, API-key env var, wire flavor) come from
//! a per-backend table; the bundled defaults cover the usual providers and
//! can be replaced wholesale via [`HttpChatTransport::with_endpoints`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{ChatMessage, ChatReply, ChatTransport, MessageRole, TokenUsage, TransportError};

/// Which wire format a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `POST {base}/v1/messages` with `x-api-key` auth.
    AnthropicMessages,
    /// `POST {base}/chat/completions` with bearer auth.
    OpenAiChat,
}

/// Endpoint description for one backend.
#[derive(Debug, Clone)]
pub struct BackendEndpoint {
    pub base_url: String,
    /// Env var holding the API key; empty means no auth (e.g. ollama).
    pub api_key_env: String,
    pub flavor: ApiFlavor,
}

impl BackendEndpoint {
    pub fn new(base_url: &str, api_key_env: &str, flavor: ApiFlavor) -> Self {
        Self {
            base_url: base_url.to_string(),
            api_key_env: api_key_env.to_string(),
            flavor,
        }
    }
}

/// Chat transport over HTTP.
pub struct HttpChatTransport {
    client: reqwest::Client,
    endpoints: HashMap<String, BackendEndpoint>,
}

impl HttpChatTransport {
    pub fn new() -> Self {
        Self::with_endpoints(default_endpoints())
    }

    pub fn with_endpoints(endpoints: HashMap<String, BackendEndpoint>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoints,
        }
    }

    fn endpoint(&self, backend: &str) -> Result<&BackendEndpoint, TransportError> {
        self.endpoints
            .get(backend)
            .ok_or_else(|| TransportError::new(None, format!("unknown backend: '{backend}'")))
    }

    fn api_key(endpoint: &BackendEndpoint) -> String {
        if endpoint.api_key_env.is_empty() {
            return String::new();
        }
        std::env::var(&endpoint.api_key_env).unwrap_or_default()
    }

    async fn post_json(
        &self,
        request: reqwest::RequestBuilder,
        body: &Value,
    ) -> Result<Value, TransportError> {
        let response = request
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::new(None, format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::new(None, format!("Failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(TransportError::new(
                Some(status.as_u16()),
                format!("API returned {status}: {text}"),
            ));
        }
        serde_json::from_str(&text)
            .map_err(|e| TransportError::new(None, format!("Failed to parse response JSON: {e}")))
    }
}

impl Default for HttpChatTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn send_chat(
        &self,
        backend: &str,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<ChatReply, TransportError> {
        let endpoint = self.endpoint(backend)?.clone();
        let api_key = Self::api_key(&endpoint);
        let base = endpoint.base_url.trim_end_matches('/');

        tracing::info!(
            "[HttpChatTransport] Calling {} (backend: {}, model: {})",
            base,
            backend,
            model
        );

        match endpoint.flavor {
            ApiFlavor::AnthropicMessages => {
                let url = format!("{base}/v1/messages");
                let body = anthropic_body(model, messages);
                let request = self
                    .client
                    .post(&url)
                    .header("x-api-key", &api_key)
                    .header("anthropic-version", "2023-06-01");
                let json = self.post_json(request, &body).await?;
                Ok(parse_anthropic(&json, model))
            }
            ApiFlavor::OpenAiChat => {
                let url = format!("{base}/chat/completions");
                let body = openai_body(model, messages);
                let mut request = self.client.post(&url);
                if !api_key.is_empty() {
                    request = request.header("Authorization", format!("Bearer {api_key}"));
                }
                let json = self.post_json(request, &body).await?;
                Ok(parse_openai(&json, model))
            }
        }
    }
}

/// Build the Anthropic messages body. System messages are lifted into the
/// top-level `system` field.
fn anthropic_body(model: &str, messages: &[ChatMessage]) -> Value {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect();

    let chat: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| {
            serde_json::json!({
                "role": match m.role {
                    MessageRole::Assistant => "assistant",
                    _ => "user",
                },
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": model,
        "max_tokens": 8192,
        "messages": chat,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system.join("\n\n"));
    }
    body
}

fn openai_body(model: &str, messages: &[ChatMessage]) -> Value {
    let chat: Vec<Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": match m.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                "content": m.content,
            })
        })
        .collect();

    serde_json::json!({
        "model": model,
        "messages": chat,
    })
}

/// Extract content/usage from an Anthropic messages response.
fn parse_anthropic(json: &Value, requested_model: &str) -> ChatReply {
    let content = json
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        block.get("text").and_then(|t| t.as_str())
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let usage = json.get("usage").map(|u| TokenUsage {
        input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()),
        output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()),
    });

    let model = json
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(requested_model)
        .to_string();

    ChatReply { content, model, usage }
}

/// Extract content/usage from an OpenAI chat-completions response.
fn parse_openai(json: &Value, requested_model: &str) -> ChatReply {
    let content = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();

    let usage = json.get("usage").map(|u| TokenUsage {
        input_tokens: u
            .get("prompt_tokens")
            .or_else(|| u.get("input_tokens"))
            .and_then(|v| v.as_u64()),
        output_tokens: u
            .get("completion_tokens")
            .or_else(|| u.get("output_tokens"))
            .and_then(|v| v.as_u64()),
    });

    let model = json
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(requested_model)
        .to_string();

    ChatReply { content, model, usage }
}

fn default_endpoints() -> HashMap<String, BackendEndpoint> {
    let mut map = HashMap::new();
    map.insert(
        "anthropic".to_string(),
        BackendEndpoint::new("https://api.anthropic.com", "ANTHROPIC_API_KEY", ApiFlavor::AnthropicMessages),
    );
    map.insert(
        "openai".to_string(),
        BackendEndpoint::new("https://api.openai.com/v1", "OPENAI_API_KEY", ApiFlavor::OpenAiChat),
    );
    map.insert(
        "gemini".to_string(),
        BackendEndpoint::new(
            "https://generativelanguage.googleapis.com/v1beta/openai",
            "GEMINI_API_KEY",
            ApiFlavor::OpenAiChat,
        ),
    );
    map.insert(
        "groq".to_string(),
        BackendEndpoint::new("https://api.groq.com/openai/v1", "GROQ_API_KEY", ApiFlavor::OpenAiChat),
    );
    map.insert(
        "deepseek".to_string(),
        BackendEndpoint::new("https://api.deepseek.com/v1", "DEEPSEEK_API_KEY", ApiFlavor::OpenAiChat),
    );
    map.insert(
        "mistral".to_string(),
        BackendEndpoint::new("https://api.mistral.ai/v1", "MISTRAL_API_KEY", ApiFlavor::OpenAiChat),
    );
    map.insert(
        "openrouter".to_string(),
        BackendEndpoint::new("https://openrouter.ai/api/v1", "OPENROUTER_API_KEY", ApiFlavor::OpenAiChat),
    );
    map.insert(
        "qwen".to_string(),
        BackendEndpoint::new(
            "https://dashscope.aliyuncs.com/compatible-mode/v1",
            "QWEN_API_KEY",
            ApiFlavor::OpenAiChat,
        ),
    );
    map.insert(
        "nvidia".to_string(),
        BackendEndpoint::new("https://integrate.api.nvidia.com/v1", "NVIDIA_API_KEY", ApiFlavor::OpenAiChat),
    );
    map.insert(
        "ollama".to_string(),
        BackendEndpoint::new("http://localhost:11434/v1", "", ApiFlavor::OpenAiChat),
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_anthropic_body_lifts_system_messages() {
        let messages = vec![
            ChatMessage::system("You are terse."),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ];
        let body = anthropic_body("claude-3-5-sonnet-20241022", &messages);

        assert_eq!(body["system"], json!("You are terse."));
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][0]["role"], json!("user"));
        assert_eq!(body["messages"][1]["role"], json!("assistant"));
        assert_eq!(body["max_tokens"], json!(8192));
    }

    #[test]
    fn test_parse_anthropic_joins_text_blocks() {
        let json = json!({
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                { "type": "text", "text": "first" },
                { "type": "tool_use", "id": "x" },
                { "type": "text", "text": "second" },
            ],
            "usage": { "input_tokens": 12, "output_tokens": 34 },
        });
        let reply = parse_anthropic(&json, "requested");

        assert_eq!(reply.content, "first\nsecond");
        assert_eq!(reply.model, "claude-3-5-sonnet-20241022");
        let usage = reply.usage.unwrap();
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(34));
    }

    #[test]
    fn test_parse_openai_with_prompt_token_names() {
        let json = json!({
            "choices": [ { "message": { "role": "assistant", "content": "answer" } } ],
            "usage": { "prompt_tokens": 5, "completion_tokens": 7 },
        });
        let reply = parse_openai(&json, "gpt-4o");

        assert_eq!(reply.content, "answer");
        assert_eq!(reply.model, "gpt-4o");
        let usage = reply.usage.unwrap();
        assert_eq!(usage.input_tokens, Some(5));
        assert_eq!(usage.output_tokens, Some(7));
    }

    #[tokio::test]
    async fn test_unknown_backend_is_not_a_quota_error() {
        let transport = HttpChatTransport::new();
        let err = transport
            .send_chat("carrier-pigeon", "any-model", &[ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(err.message.contains("unknown backend"));
        assert!(!crate::llm::is_quota_error(&err));
    }

    #[test]
    fn test_default_endpoints_cover_fallback_backends() {
        let endpoints = default_endpoints();
        assert!(endpoints.contains_key("gemini"));
        assert!(endpoints.contains_key("openrouter"));
        assert_eq!(endpoints["anthropic"].flavor, ApiFlavor::AnthropicMessages);
        assert!(endpoints["ollama"].api_key_env.is_empty());
    }
}
