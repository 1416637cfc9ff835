//! Execution-side data model: statuses, the per-execution context, and the
//! results handed back to callers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Notify, RwLock};

/// Workflow status: `pending → running → {completed | failed | cancelled}`,
/// with `running ⇄ paused` as a cooperative side-loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step status: `pending → running → {completed | failed | skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Outcome record for one step of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Retry attempts actually consumed.
    pub retries: u32,
}

impl StepResult {
    pub(crate) fn running(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            retries: 0,
        }
    }

    pub(crate) fn skipped(step_id: &str) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            output: None,
            error: None,
            started_at: now,
            completed_at: Some(now),
            retries: 0,
        }
    }
}

/// Mutable state of one execution. Exactly one exists per execution id; the
/// engine keeps the authoritative copy and inspection returns snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub execution_id: String,
    /// Caller-supplied input.
    pub input: Value,
    /// Accumulated result bag, keyed by step id.
    pub output: Map<String, Value>,
    /// Free-form scratch space for inter-step data passing.
    pub variables: HashMap<String, Value>,
    pub step_results: HashMap<String, StepResult>,
    /// Id of the step in flight, if any.
    pub current_step: Option<String>,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowContext {
    pub(crate) fn new(workflow_id: &str, execution_id: &str, input: Value) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
            input,
            output: Map::new(),
            variables: HashMap::new(),
            step_results: HashMap::new(),
            current_step: None,
            status: WorkflowStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}

/// Returned to the caller of `execute` once the run reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub success: bool,
    pub execution_id: String,
    pub output: Map<String, Value>,
    /// In definition order; never longer than the definition's step list.
    pub step_results: Vec<StepResult>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Registry entry for a live or finished execution: the shared context plus
/// the wakeup used by resume/cancel while the walk is paused.
pub(crate) struct ExecutionHandle {
    pub(crate) context: RwLock<WorkflowContext>,
    pub(crate) resumed: Notify,
}

impl ExecutionHandle {
    pub(crate) fn new(context: WorkflowContext) -> Self {
        Self {
            context: RwLock::new(context),
            resumed: Notify::new(),
        }
    }
}

/// Handle passed to step handlers: access to the execution's shared context
/// plus the identity of the step in flight.
///
/// Accessors take short-lived locks, so inspection and control calls never
/// block behind a slow handler.
#[derive(Clone)]
pub struct StepScope {
    handle: Arc<ExecutionHandle>,
    workflow_id: String,
    execution_id: String,
    step_id: String,
    step_name: String,
}

impl StepScope {
    pub(crate) fn new(
        handle: Arc<ExecutionHandle>,
        workflow_id: &str,
        execution_id: &str,
        step_id: &str,
        step_name: &str,
    ) -> Self {
        Self {
            handle,
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// The caller-supplied execution input.
    pub async fn input(&self) -> Value {
        self.handle.context.read().await.input.clone()
    }

    /// Read a scratch variable.
    pub async fn variable(&self, key: &str) -> Option<Value> {
        self.handle.context.read().await.variables.get(key).cloned()
    }

    /// Write a scratch variable for downstream steps.
    pub async fn set_variable(&self, key: &str, value: Value) {
        self.handle
            .context
            .write()
            .await
            .variables
            .insert(key.to_string(), value);
    }

    /// Output recorded by an earlier step, if any.
    pub async fn output_of(&self, step_id: &str) -> Option<Value> {
        self.handle.context.read().await.output.get(step_id).cloned()
    }

    /// A point-in-time clone of the whole context.
    pub async fn snapshot(&self) -> WorkflowContext {
        self.handle.context.read().await.clone()
    }
}
