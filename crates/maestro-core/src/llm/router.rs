//! Quota-aware model fallback.
//!
//! A backend reporting exhaustion (HTTP 429, quota/rate-limit messages) is
//! not a genuine failure — the same request is worth retrying against the
//! next candidate model. Anything else propagates unchanged: masking a bad
//! request as "try the next model" would hide bugs and waste calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::FallbackConfig;
use crate::error::CoreError;

use super::{ChatMessage, ChatResponse, ChatTransport, TransportError};

/// Gemini candidates, most capable/available first.
pub const GEMINI_FALLBACK_MODELS: &[&str] = &[
    "gemini-2.0-flash",
    "gemini-2.0-flash-exp",
    "gemini-2.0-flash-lite",
    "gemini-1.5-flash",
    "gemini-1.5-pro",
];

/// OpenRouter candidates, most capable/available first.
pub const OPENROUTER_FALLBACK_MODELS: &[&str] = &[
    "anthropic/claude-sonnet-4",
    "anthropic/claude-sonnet-4:thinking",
    "anthropic/claude-opus-4:thinking",
    "openai/gpt-4o",
    "meta-llama/llama-3.1-405b-instruct",
];

/// Classify a transport failure as backend exhaustion.
///
/// Deliberately conservative: HTTP 429 or an explicit exhaustion marker in
/// the message. Ambiguous errors (e.g. "maximum context length exceeded")
/// are not quota errors.
pub fn is_quota_error(error: &TransportError) -> bool {
    if error.status == Some(429) {
        return true;
    }
    const MARKERS: &[&str] = &[
        "quota",
        "rate limit",
        "rate_limit",
        "too many requests",
        "resource exhausted",
        "resource_exhausted",
        "429",
    ];
    let message = error.message.to_lowercase();
    MARKERS.iter().any(|marker| message.contains(marker))
}

/// Routes chat calls through a transport, substituting fallback candidates
/// on exhaustion.
pub struct ModelRouter {
    transport: Arc<dyn ChatTransport>,
    /// Ordered fallback candidates per backend.
    candidates: HashMap<String, Vec<String>>,
    fallback_enabled: AtomicBool,
}

impl ModelRouter {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            candidates: default_candidates(),
            fallback_enabled: AtomicBool::new(true),
        }
    }

    /// Build a router with config-supplied candidate lists layered over the
    /// built-in ones.
    pub fn with_config(transport: Arc<dyn ChatTransport>, config: &FallbackConfig) -> Self {
        let mut candidates = default_candidates();
        for (backend, models) in &config.candidates {
            candidates.insert(backend.clone(), models.clone());
        }
        Self {
            transport,
            candidates,
            fallback_enabled: AtomicBool::new(config.enabled),
        }
    }

    /// Disabling fallback gives deterministic single-model semantics: the
    /// first transport failure propagates regardless of classification.
    pub fn set_fallback_enabled(&self, enabled: bool) {
        self.fallback_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled.load(Ordering::SeqCst)
    }

    pub fn candidates_for(&self, backend: &str) -> &[String] {
        self.candidates.get(backend).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ask `model` on `backend`, falling back through the backend's
    /// candidate list on exhaustion.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        backend: &str,
        model: &str,
    ) -> Result<ChatResponse, CoreError> {
        let chain = self.candidate_chain(backend, model);
        let total = chain.len();
        let mut last_quota: Option<TransportError> = None;

        for (index, candidate) in chain.iter().enumerate() {
            match self.transport.send_chat(backend, candidate, messages).await {
                Ok(reply) => {
                    let used_fallback = index > 0;
                    if used_fallback {
                        tracing::warn!(
                            "[ModelRouter] Fallback engaged: {} answered for {} (requested {})",
                            candidate,
                            backend,
                            model
                        );
                    }
                    return Ok(ChatResponse {
                        content: reply.content,
                        backend: backend.to_string(),
                        model: reply.model,
                        usage: reply.usage,
                        used_fallback,
                        original_model: used_fallback.then(|| model.to_string()),
                    });
                }
                Err(err) => {
                    if !self.fallback_enabled() || !is_quota_error(&err) {
                        return Err(CoreError::Transport(err));
                    }
                    tracing::warn!(
                        "[ModelRouter] Quota exhausted on {} ({}/{} candidates): {}",
                        candidate,
                        index + 1,
                        total,
                        err
                    );
                    last_quota = Some(err);
                }
            }
        }

        let message = last_quota
            .map(|err| err.message)
            .unwrap_or_else(|| "no candidates configured".to_string());
        Err(CoreError::QuotaExhausted { backend: backend.to_string(), message })
    }

    /// The requested model first, then the backend's candidates (minus the
    /// requested model, so it is never tried twice).
    fn candidate_chain(&self, backend: &str, model: &str) -> Vec<String> {
        let mut chain = vec![model.to_string()];
        for candidate in self.candidates_for(backend) {
            if candidate != model {
                chain.push(candidate.clone());
            }
        }
        chain
    }
}

fn default_candidates() -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    map.insert(
        "gemini".to_string(),
        GEMINI_FALLBACK_MODELS.iter().map(|m| m.to_string()).collect(),
    );
    map.insert(
        "openrouter".to_string(),
        OPENROUTER_FALLBACK_MODELS.iter().map(|m| m.to_string()).collect(),
    );
    map
}
