//! Core error type for the Maestro orchestration library.
//!
//! `CoreError` is used throughout the core (engine, limiter, fallback).
//! When the `axum` feature is enabled, it also implements `IntoResponse`
//! so it can be used directly as an axum handler error type.

use crate::llm::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Unknown workflow or execution id. Never retried.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A step's skip predicate failed. Treated as a step failure, not a skip.
    #[error("Condition error: {0}")]
    Condition(String),

    /// A step handler failed. Eligible for the step's retry policy.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A deadline elapsed — a step handler or a permit acquisition.
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Every fallback candidate for a backend reported exhaustion.
    #[error("All fallback candidates exhausted for backend '{backend}': {message}")]
    QuotaExhausted { backend: String, message: String },

    /// The limiter was drained while the caller was waiting. Fatal to that caller.
    #[error("Limiter drained")]
    Drained,

    /// The backend transport reported a non-quota failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            CoreError::QuotaExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            CoreError::Drained => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Transport(_) => StatusCode::BAD_GATEWAY,
            CoreError::Condition(_) | CoreError::Handler(_) | CoreError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
