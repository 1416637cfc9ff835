//! Workflow definitions: steps, per-step policy, and the handler seams.
//!
//! A definition is an ordered list of steps. Each step carries its own
//! retry/timeout/skip policy and an action — the unit of work the engine
//! invokes under a limiter permit. Actions, conditions, and hooks are trait
//! objects so steps can be built from closures or from purpose-built types
//! (e.g. [`crate::llm::AgentAction`]) and tested independently of the engine.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;
use crate::workflow::context::{StepScope, WorkflowContext};

/// One unit of executable work inside a step.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn run(&self, scope: StepScope) -> Result<Value, CoreError>;
}

/// Skip predicate, evaluated against a context snapshot before each attempt.
/// `Ok(false)` skips the step; an `Err` is a step failure, never a skip.
pub trait StepCondition: Send + Sync {
    fn evaluate(&self, context: &WorkflowContext) -> Result<bool, CoreError>;
}

impl<F> StepCondition for F
where
    F: Fn(&WorkflowContext) -> Result<bool, CoreError> + Send + Sync,
{
    fn evaluate(&self, context: &WorkflowContext) -> Result<bool, CoreError> {
        self(context)
    }
}

/// Step-level recovery hook, invoked once the retry policy is exhausted.
/// Returning `Ok` absorbs the failure (the walk continues); returning `Err`
/// escalates it to the workflow level.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    async fn recover(&self, error: &CoreError, scope: StepScope) -> Result<(), CoreError>;
}

/// Workflow-level hook invoked after a successful run.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_complete(&self, context: &WorkflowContext) -> Result<(), CoreError>;
}

/// Workflow-level hook invoked when an execution fails.
#[async_trait]
pub trait FailureHook: Send + Sync {
    async fn on_error(&self, error: &CoreError, context: &WorkflowContext) -> Result<(), CoreError>;
}

// Adapter so plain async closures can serve as step actions.
struct FnAction<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> StepAction for FnAction<F, Fut>
where
    F: Fn(StepScope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, CoreError>> + Send,
{
    async fn run(&self, scope: StepScope) -> Result<Value, CoreError> {
        (self.f)(scope).await
    }
}

/// One step of a workflow, with its own retry/timeout/skip policy.
#[derive(Clone)]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    pub action: Arc<dyn StepAction>,
    pub condition: Option<Arc<dyn StepCondition>>,
    pub on_error: Option<Arc<dyn RecoveryHook>>,
    /// Max additional attempts after the first.
    pub retries: u32,
    /// Deadline per handler invocation; absent means no deadline.
    pub timeout: Option<Duration>,
    /// Limiter key this step competes under (e.g. the backend it calls).
    pub resource: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action,
            condition: None,
            on_error: None,
            retries: 0,
            timeout: None,
            resource: None,
        }
    }

    /// Build a step from an async closure.
    pub fn handler_fn<F, Fut>(id: impl Into<String>, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepScope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
    {
        Self::new(id, name, Arc::new(FnAction { f, _marker: PhantomData }))
    }

    pub fn condition<C: StepCondition + 'static>(mut self, condition: C) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn on_error<H: RecoveryHook + 'static>(mut self, hook: H) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn resource(mut self, key: impl Into<String>) -> Self {
        self.resource = Some(key.into());
        self
    }
}

impl fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_condition", &self.condition.is_some())
            .field("has_on_error", &self.on_error.is_some())
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .field("resource", &self.resource)
            .finish()
    }
}

/// A named, ordered list of steps with shared error-handling hooks.
/// Immutable once registered; re-registering an id overwrites.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub version: String,
    pub steps: Vec<WorkflowStep>,
    pub on_complete: Option<Arc<dyn CompletionHook>>,
    pub on_error: Option<Arc<dyn FailureHook>>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            version: "1.0.0".to_string(),
            steps: Vec::new(),
            on_complete: None,
            on_error: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Append a step; steps run in the order they are added.
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn on_complete<H: CompletionHook + 'static>(mut self, hook: H) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    pub fn on_error<H: FailureHook + 'static>(mut self, hook: H) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_builder() {
        let step = WorkflowStep::handler_fn("fetch", "Fetch", |_scope| async { Ok(json!(1)) })
            .retries(3)
            .timeout(Duration::from_secs(30))
            .resource("backend:glm");

        assert_eq!(step.id, "fetch");
        assert_eq!(step.retries, 3);
        assert_eq!(step.timeout, Some(Duration::from_secs(30)));
        assert_eq!(step.resource.as_deref(), Some("backend:glm"));
        assert!(step.condition.is_none());
    }

    #[test]
    fn test_definition_builder_keeps_step_order() {
        let definition = WorkflowDefinition::new("deploy", "Deploy Flow")
            .version("2.0.0")
            .step(WorkflowStep::handler_fn("build", "Build", |_s| async { Ok(json!(null)) }))
            .step(WorkflowStep::handler_fn("ship", "Ship", |_s| async { Ok(json!(null)) }));

        assert_eq!(definition.version, "2.0.0");
        let ids: Vec<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["build", "ship"]);
    }
}
