//! Workflow engine — multi-step agent orchestration with per-step policy.
//!
//! ```text
//! WorkflowDefinition ──► WorkflowEngine::execute
//!        │                      │
//!    WorkflowStep          LimiterRegistry (admission)
//!   (action/condition/         │
//!    retries/timeout)      EventBus (lifecycle signals)
//! ```

pub mod context;
pub mod engine;
pub mod schema;

pub use context::{
    StepResult, StepScope, StepStatus, WorkflowContext, WorkflowResult, WorkflowStatus,
};
pub use engine::WorkflowEngine;
pub use schema::{
    CompletionHook, FailureHook, RecoveryHook, StepAction, StepCondition, WorkflowDefinition,
    WorkflowStep,
};
