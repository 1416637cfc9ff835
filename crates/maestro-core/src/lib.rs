//! Maestro Core — resilient orchestration for AI-agent workflows.
//!
//! Three cooperating pieces:
//!
//! - [`workflow::WorkflowEngine`] executes registered multi-step workflows
//!   with per-step retry/timeout/skip policy and pause/resume/cancel
//!   control.
//! - [`limiter::Limiter`] bounds how many steps (and their downstream
//!   network calls) run at once; a [`limiter::LimiterRegistry`] keys
//!   limiters by resource.
//! - [`llm::ModelRouter`] keeps an agent call alive by retrying against an
//!   ordered list of alternate models when a backend reports exhaustion.
//!
//! The engine invokes step handlers under a limiter permit; handlers that
//! talk to a model go through the router; everything reports on an injected
//! [`events::EventBus`]. One engine per process is the normal deployment
//! shape, but nothing here is a singleton — construct, clone, inject.
//!
//! # Feature Flags
//!
//! - `axum` — Enables `IntoResponse` impl on `CoreError` for axum handlers.

pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod llm;
pub mod workflow;

// Convenience re-exports
pub use config::{CoreConfig, FallbackConfig};
pub use error::CoreError;
pub use events::{EventBus, EventEnvelope, EventKind};
pub use limiter::{Limiter, LimiterRegistry};
pub use llm::{AgentAction, ChatMessage, ChatResponse, ChatTransport, ModelRouter};
pub use workflow::{
    StepResult, StepScope, StepStatus, WorkflowContext, WorkflowDefinition, WorkflowEngine,
    WorkflowResult, WorkflowStatus, WorkflowStep,
};
