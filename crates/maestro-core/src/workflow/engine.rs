//! Workflow Engine — registers definitions and runs them to completion.
//!
//! One engine owns the definition registry, the execution registry, and the
//! limiter registry. `execute` walks a definition's steps in order: skip
//! condition, limiter permit, handler (raced against the step timeout),
//! retry policy, recovery hook. Pause/resume/cancel act between steps; an
//! in-flight handler always runs to completion or its own timeout before
//! cancellation takes effect.
//!
//! Every transition is reported on the injected [`EventBus`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::{EventBus, EventEnvelope, EventKind};
use crate::limiter::{Limiter, LimiterRegistry};
use crate::workflow::context::{
    ExecutionHandle, StepResult, StepScope, StepStatus, WorkflowContext, WorkflowResult,
    WorkflowStatus,
};
use crate::workflow::schema::{WorkflowDefinition, WorkflowStep};

/// Limiter key for steps that don't name a resource.
const DEFAULT_RESOURCE: &str = "default";

enum StepOutcome {
    /// Walk on: the step completed, skipped, or recovered locally.
    Continue,
    /// Escalated failure: stop the walk and fail the execution.
    Halt(CoreError),
}

enum ConditionVerdict {
    Run,
    Skip,
    Failed(CoreError),
}

struct EngineInner {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    executions: RwLock<HashMap<String, Arc<ExecutionHandle>>>,
    limiters: LimiterRegistry,
    events: EventBus,
    config: CoreConfig,
}

/// The workflow engine. Cheap to clone; all clones share the same
/// registries, so executions started from different tasks are visible to
/// each other's control and inspection calls.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(events: EventBus) -> Self {
        Self::with_config(events, CoreConfig::default())
    }

    pub fn with_config(events: EventBus, config: CoreConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                definitions: RwLock::new(HashMap::new()),
                executions: RwLock::new(HashMap::new()),
                limiters: LimiterRegistry::new(),
                events,
                config,
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn limiters(&self) -> &LimiterRegistry {
        &self.inner.limiters
    }

    // ── Definition management ────────────────────────────────────────

    /// Register a workflow definition; re-registering an id overwrites.
    pub async fn register(&self, definition: WorkflowDefinition) {
        tracing::info!(
            "[Engine] Registered workflow '{}' ({} steps)",
            definition.id,
            definition.steps.len()
        );
        self.inner
            .definitions
            .write()
            .await
            .insert(definition.id.clone(), Arc::new(definition));
    }

    /// Remove a definition. Returns whether it existed.
    pub async fn unregister(&self, workflow_id: &str) -> bool {
        self.inner.definitions.write().await.remove(workflow_id).is_some()
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.inner.definitions.read().await.get(workflow_id).cloned()
    }

    pub async fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.inner.definitions.read().await.values().cloned().collect()
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Run a workflow to a terminal state.
    ///
    /// Fails fast with [`CoreError::NotFound`] for an unregistered id;
    /// otherwise always returns a [`WorkflowResult`] — failures inside the
    /// walk land in `result.error`, never in the `Err` channel.
    pub async fn execute(&self, workflow_id: &str, input: Value) -> Result<WorkflowResult, CoreError> {
        let definition = self
            .get_workflow(workflow_id)
            .await
            .ok_or_else(|| CoreError::NotFound(format!("workflow not registered: {workflow_id}")))?;

        let execution_id = Uuid::new_v4().to_string();
        let context = WorkflowContext::new(workflow_id, &execution_id, input);
        let started_at = context.started_at;

        let handle = Arc::new(ExecutionHandle::new(context));
        self.inner
            .executions
            .write()
            .await
            .insert(execution_id.clone(), handle.clone());

        {
            let mut ctx = handle.context.write().await;
            if ctx.status == WorkflowStatus::Pending {
                ctx.status = WorkflowStatus::Running;
            }
        }
        tracing::info!(
            "[Engine] Execution {} started for workflow '{}'",
            execution_id,
            workflow_id
        );
        self.emit(EventKind::WorkflowStarted, workflow_id, &execution_id, None, Value::Null)
            .await;

        let mut walk_error: Option<CoreError> = None;
        for step in &definition.steps {
            // Control gate between steps: block while paused, stop on cancel.
            if self.await_runnable(&handle).await == WorkflowStatus::Cancelled {
                break;
            }
            match self.run_step(&definition, step, &handle, &execution_id).await {
                StepOutcome::Continue => {}
                StepOutcome::Halt(err) => {
                    walk_error = Some(err);
                    break;
                }
            }
        }

        // ── Finalize ─────────────────────────────────────────────────
        let cancelled = handle.context.read().await.status == WorkflowStatus::Cancelled;
        let (final_status, error_message) = match (&walk_error, cancelled) {
            (Some(err), _) => (WorkflowStatus::Failed, Some(err.to_string())),
            (None, true) => (WorkflowStatus::Cancelled, Some("execution cancelled".to_string())),
            (None, false) => (WorkflowStatus::Completed, None),
        };

        let completed_at = Utc::now();
        let (output, step_results) = {
            let mut ctx = handle.context.write().await;
            ctx.status = final_status;
            ctx.completed_at = Some(completed_at);
            ctx.current_step = None;
            ctx.error = error_message.clone();
            let step_results: Vec<StepResult> = definition
                .steps
                .iter()
                .filter_map(|step| ctx.step_results.get(&step.id).cloned())
                .collect();
            (ctx.output.clone(), step_results)
        };
        let duration_ms = completed_at
            .signed_duration_since(started_at)
            .num_milliseconds()
            .max(0) as u64;

        let snapshot = handle.context.read().await.clone();
        match final_status {
            WorkflowStatus::Completed => {
                if let Some(hook) = &definition.on_complete {
                    if let Err(err) = hook.on_complete(&snapshot).await {
                        tracing::error!(
                            "[Engine] onComplete hook failed for execution {}: {}",
                            execution_id,
                            err
                        );
                    }
                }
                tracing::info!("[Engine] Execution {} completed in {}ms", execution_id, duration_ms);
                self.emit(
                    EventKind::WorkflowCompleted,
                    workflow_id,
                    &execution_id,
                    None,
                    json!({ "durationMs": duration_ms }),
                )
                .await;
            }
            WorkflowStatus::Failed => {
                if let (Some(hook), Some(err)) = (&definition.on_error, walk_error.as_ref()) {
                    if let Err(hook_err) = hook.on_error(err, &snapshot).await {
                        tracing::error!(
                            "[Engine] onError hook failed for execution {}: {}",
                            execution_id,
                            hook_err
                        );
                    }
                }
                tracing::error!(
                    "[Engine] Execution {} failed: {}",
                    execution_id,
                    error_message.as_deref().unwrap_or("unknown")
                );
                self.emit(
                    EventKind::WorkflowFailed,
                    workflow_id,
                    &execution_id,
                    None,
                    json!({ "error": error_message.clone() }),
                )
                .await;
            }
            WorkflowStatus::Cancelled => {
                tracing::info!("[Engine] Execution {} cancelled", execution_id);
                self.emit(EventKind::WorkflowCancelled, workflow_id, &execution_id, None, Value::Null)
                    .await;
            }
            _ => {}
        }

        Ok(WorkflowResult {
            success: final_status == WorkflowStatus::Completed,
            execution_id,
            output,
            step_results,
            duration_ms,
            error: error_message,
        })
    }

    /// Block between steps while the execution is paused.
    async fn await_runnable(&self, handle: &Arc<ExecutionHandle>) -> WorkflowStatus {
        loop {
            let status = handle.context.read().await.status;
            match status {
                WorkflowStatus::Paused => handle.resumed.notified().await,
                other => return other,
            }
        }
    }

    async fn run_step(
        &self,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        handle: &Arc<ExecutionHandle>,
        execution_id: &str,
    ) -> StepOutcome {
        let workflow_id = definition.id.as_str();
        let scope = StepScope::new(handle.clone(), workflow_id, execution_id, &step.id, &step.name);

        // Skip predicate, evaluated before a permit is taken. A throwing
        // predicate is a step failure (retry-eligible), never a silent skip.
        let mut pending_failure = match self.eval_condition(step, handle).await {
            ConditionVerdict::Run => None,
            ConditionVerdict::Skip => {
                return self.record_skip(workflow_id, execution_id, step, handle, 0).await;
            }
            ConditionVerdict::Failed(err) => Some(err),
        };

        // Admission under the step's resource budget. The permit is held
        // across retries and released when the step settles.
        let key = step
            .resource
            .clone()
            .unwrap_or_else(|| DEFAULT_RESOURCE.to_string());
        let limiter = self.inner.limiters.get(&key, self.inner.config.limit_for(&key));
        if !limiter.try_acquire() {
            self.emit(
                EventKind::StepQueued,
                workflow_id,
                execution_id,
                Some(&step.id),
                json!({ "resource": key }),
            )
            .await;
            if let Err(err) = limiter.acquire(None).await {
                // Drained at shutdown: fatal to this execution, no retries.
                let mut result = StepResult::running(&step.id);
                result.status = StepStatus::Failed;
                result.error = Some(err.to_string());
                result.completed_at = Some(Utc::now());
                handle
                    .context
                    .write()
                    .await
                    .step_results
                    .insert(step.id.clone(), result);
                self.emit(
                    EventKind::StepFailed,
                    workflow_id,
                    execution_id,
                    Some(&step.id),
                    json!({ "error": err.to_string() }),
                )
                .await;
                return StepOutcome::Halt(err);
            }
        }
        let _permit = PermitGuard { limiter };

        {
            let mut ctx = handle.context.write().await;
            ctx.current_step = Some(step.id.clone());
            ctx.step_results
                .insert(step.id.clone(), StepResult::running(&step.id));
        }
        tracing::info!("[Engine] Step '{}' started (execution {})", step.id, execution_id);
        self.emit(EventKind::StepStarted, workflow_id, execution_id, Some(&step.id), Value::Null)
            .await;

        let mut attempt: u32 = 0;
        let failure = loop {
            if attempt > 0 && pending_failure.is_none() {
                match self.eval_condition(step, handle).await {
                    ConditionVerdict::Run => {}
                    ConditionVerdict::Skip => {
                        return self
                            .record_skip(workflow_id, execution_id, step, handle, attempt)
                            .await;
                    }
                    ConditionVerdict::Failed(err) => pending_failure = Some(err),
                }
            }

            let error = match pending_failure.take() {
                Some(err) => err,
                None => match self.invoke_handler(step, scope.clone()).await {
                    Ok(output) => {
                        {
                            let mut ctx = handle.context.write().await;
                            if let Some(result) = ctx.step_results.get_mut(&step.id) {
                                result.status = StepStatus::Completed;
                                result.output = Some(output.clone());
                                result.completed_at = Some(Utc::now());
                                result.retries = attempt;
                            }
                            ctx.output.insert(step.id.clone(), output.clone());
                        }
                        tracing::info!(
                            "[Engine] Step '{}' completed (execution {})",
                            step.id,
                            execution_id
                        );
                        self.emit(
                            EventKind::StepCompleted,
                            workflow_id,
                            execution_id,
                            Some(&step.id),
                            json!({ "retries": attempt, "output": output }),
                        )
                        .await;
                        return StepOutcome::Continue;
                    }
                    Err(err) => err,
                },
            };

            // Timeouts follow the same failure path but are reported
            // distinctly for observability.
            if matches!(error, CoreError::Timeout(_)) {
                self.emit(
                    EventKind::StepTimedOut,
                    workflow_id,
                    execution_id,
                    Some(&step.id),
                    json!({ "error": error.to_string() }),
                )
                .await;
            }

            if attempt < step.retries {
                attempt += 1;
                if let Some(result) = handle.context.write().await.step_results.get_mut(&step.id) {
                    result.retries = attempt;
                }
                tracing::warn!(
                    "[Engine] Step '{}' failed, retrying ({}/{}): {}",
                    step.id,
                    attempt,
                    step.retries,
                    error
                );
                self.emit(
                    EventKind::StepRetried,
                    workflow_id,
                    execution_id,
                    Some(&step.id),
                    json!({ "attempt": attempt, "error": error.to_string() }),
                )
                .await;
                tokio::time::sleep(self.backoff(attempt)).await;
                continue;
            }
            break error;
        };

        // Retries exhausted: record the failure, then let the step's
        // recovery hook absorb it or escalate.
        {
            let mut ctx = handle.context.write().await;
            if let Some(result) = ctx.step_results.get_mut(&step.id) {
                result.status = StepStatus::Failed;
                result.error = Some(failure.to_string());
                result.completed_at = Some(Utc::now());
                result.retries = attempt;
            }
        }
        tracing::error!(
            "[Engine] Step '{}' failed after {} retries: {}",
            step.id,
            attempt,
            failure
        );
        self.emit(
            EventKind::StepFailed,
            workflow_id,
            execution_id,
            Some(&step.id),
            json!({ "error": failure.to_string(), "retries": attempt }),
        )
        .await;

        if let Some(hook) = &step.on_error {
            match hook.recover(&failure, scope.clone()).await {
                Ok(()) => {
                    tracing::warn!(
                        "[Engine] Step '{}' failure absorbed by its recovery hook",
                        step.id
                    );
                    return StepOutcome::Continue;
                }
                Err(rethrown) => return StepOutcome::Halt(rethrown),
            }
        }
        StepOutcome::Halt(failure)
    }

    async fn eval_condition(
        &self,
        step: &WorkflowStep,
        handle: &Arc<ExecutionHandle>,
    ) -> ConditionVerdict {
        let Some(condition) = &step.condition else {
            return ConditionVerdict::Run;
        };
        let snapshot = handle.context.read().await.clone();
        match condition.evaluate(&snapshot) {
            Ok(true) => ConditionVerdict::Run,
            Ok(false) => ConditionVerdict::Skip,
            Err(CoreError::Condition(message)) => {
                ConditionVerdict::Failed(CoreError::Condition(message))
            }
            Err(other) => ConditionVerdict::Failed(CoreError::Condition(other.to_string())),
        }
    }

    async fn record_skip(
        &self,
        workflow_id: &str,
        execution_id: &str,
        step: &WorkflowStep,
        handle: &Arc<ExecutionHandle>,
        attempts: u32,
    ) -> StepOutcome {
        let mut result = StepResult::skipped(&step.id);
        result.retries = attempts;
        handle
            .context
            .write()
            .await
            .step_results
            .insert(step.id.clone(), result);
        tracing::info!("[Engine] Step '{}' skipped (condition not met)", step.id);
        self.emit(EventKind::StepSkipped, workflow_id, execution_id, Some(&step.id), Value::Null)
            .await;
        StepOutcome::Continue
    }

    async fn invoke_handler(&self, step: &WorkflowStep, scope: StepScope) -> Result<Value, CoreError> {
        match step.timeout {
            Some(limit) => match tokio::time::timeout(limit, step.action.run(scope)).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout(limit.as_millis() as u64)),
            },
            None => step.action.run(scope).await,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.inner.config.retry_backoff() * 2u32.saturating_pow(attempt.min(16))
    }

    async fn emit(
        &self,
        kind: EventKind,
        workflow_id: &str,
        execution_id: &str,
        step_id: Option<&str>,
        data: Value,
    ) {
        let mut envelope = EventEnvelope::new(kind, workflow_id, execution_id).data(data);
        if let Some(id) = step_id {
            envelope = envelope.step(id);
        }
        self.inner.events.publish(envelope).await;
    }

    // ── Control ──────────────────────────────────────────────────────

    async fn handle(&self, execution_id: &str) -> Result<Arc<ExecutionHandle>, CoreError> {
        self.inner
            .executions
            .read()
            .await
            .get(execution_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("execution not found: {execution_id}")))
    }

    /// Suspend the walk at the next step boundary. Returns whether the
    /// transition was legal from the current state.
    pub async fn pause(&self, execution_id: &str) -> Result<bool, CoreError> {
        let handle = self.handle(execution_id).await?;
        let mut ctx = handle.context.write().await;
        if ctx.status != WorkflowStatus::Running {
            return Ok(false);
        }
        ctx.status = WorkflowStatus::Paused;
        drop(ctx);
        tracing::info!("[Engine] Execution {} paused", execution_id);
        Ok(true)
    }

    /// Resume a paused walk at the step it stopped before.
    pub async fn resume(&self, execution_id: &str) -> Result<bool, CoreError> {
        let handle = self.handle(execution_id).await?;
        let mut ctx = handle.context.write().await;
        if ctx.status != WorkflowStatus::Paused {
            return Ok(false);
        }
        ctx.status = WorkflowStatus::Running;
        drop(ctx);
        handle.resumed.notify_one();
        tracing::info!("[Engine] Execution {} resumed", execution_id);
        Ok(true)
    }

    /// Cancel an execution. Takes effect at the next step boundary; an
    /// in-flight handler runs to completion first.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool, CoreError> {
        let handle = self.handle(execution_id).await?;
        let mut ctx = handle.context.write().await;
        if ctx.status.is_terminal() {
            return Ok(false);
        }
        ctx.status = WorkflowStatus::Cancelled;
        drop(ctx);
        handle.resumed.notify_one();
        tracing::info!("[Engine] Execution {} cancelled", execution_id);
        Ok(true)
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// Snapshot of one execution's context.
    pub async fn get_execution(&self, execution_id: &str) -> Option<WorkflowContext> {
        let handle = self.inner.executions.read().await.get(execution_id).cloned()?;
        let ctx = handle.context.read().await.clone();
        Some(ctx)
    }

    /// Snapshots of all executions, optionally filtered by workflow.
    pub async fn list_executions(&self, workflow_id: Option<&str>) -> Vec<WorkflowContext> {
        let handles: Vec<Arc<ExecutionHandle>> =
            self.inner.executions.read().await.values().cloned().collect();
        let mut contexts = Vec::with_capacity(handles.len());
        for handle in handles {
            let ctx = handle.context.read().await.clone();
            if workflow_id.map_or(true, |id| ctx.workflow_id == id) {
                contexts.push(ctx);
            }
        }
        contexts
    }

    /// Remove terminal executions older than `max_age`; returns the count
    /// removed. Bounds memory for long-running processes.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(max_age.as_millis() as i64);
        let mut executions = self.inner.executions.write().await;
        let mut doomed = Vec::new();
        for (id, handle) in executions.iter() {
            let ctx = handle.context.read().await;
            if ctx.status.is_terminal() && ctx.completed_at.is_some_and(|at| at < cutoff) {
                doomed.push(id.clone());
            }
        }
        for id in &doomed {
            executions.remove(id);
        }
        if !doomed.is_empty() {
            tracing::info!("[Engine] Cleaned up {} finished executions", doomed.len());
        }
        doomed.len()
    }
}

struct PermitGuard {
    limiter: Limiter,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::RecoveryHook;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn test_engine() -> WorkflowEngine {
        let config = CoreConfig {
            retry_backoff_ms: 0,
            ..CoreConfig::default()
        };
        WorkflowEngine::with_config(EventBus::new(), config)
    }

    #[tokio::test]
    async fn test_execute_unknown_workflow() {
        let engine = test_engine();
        let err = engine.execute("ghost", json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_two_steps_with_retries() {
        let engine = test_engine();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_step = attempts.clone();

        engine
            .register(
                WorkflowDefinition::new("w", "Retry Flow")
                    .step(WorkflowStep::handler_fn("a", "A", |_s| async { Ok(json!("a-done")) }))
                    .step(
                        WorkflowStep::handler_fn("b", "B", move |_s| {
                            let attempts = attempts_in_step.clone();
                            async move {
                                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                                    Err(CoreError::Handler("not yet".to_string()))
                                } else {
                                    Ok(json!("b-done"))
                                }
                            }
                        })
                        .retries(2),
                    ),
            )
            .await;

        let result = engine.execute("w", json!({})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.step_results.len(), 2);
        let b = &result.step_results[1];
        assert_eq!(b.status, StepStatus::Completed);
        assert_eq!(b.retries, 2);
        assert_eq!(result.output.get("b"), Some(&json!("b-done")));
    }

    #[tokio::test]
    async fn test_false_condition_skips_without_invoking_handler() {
        let engine = test_engine();
        let invoked = Arc::new(AtomicU32::new(0));
        let invoked_in_step = invoked.clone();

        engine
            .register(
                WorkflowDefinition::new("w", "Skip Flow").step(
                    WorkflowStep::handler_fn("a", "A", move |_s| {
                        let invoked = invoked_in_step.clone();
                        async move {
                            invoked.fetch_add(1, Ordering::SeqCst);
                            Ok(json!(null))
                        }
                    })
                    .condition(|_ctx: &WorkflowContext| -> Result<bool, CoreError> { Ok(false) }),
                ),
            )
            .await;

        let result = engine.execute("w", json!({})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.step_results[0].status, StepStatus::Skipped);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_condition_error_fails_the_step() {
        let engine = test_engine();
        engine
            .register(
                WorkflowDefinition::new("w", "Broken Predicate").step(
                    WorkflowStep::handler_fn("a", "A", |_s| async { Ok(json!(null)) }).condition(
                        |_ctx: &WorkflowContext| -> Result<bool, CoreError> {
                            Err(CoreError::Condition("predicate blew up".to_string()))
                        },
                    ),
                ),
            )
            .await;

        let result = engine.execute("w", json!({})).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.step_results[0].status, StepStatus::Failed);
        assert!(result.error.unwrap().contains("predicate blew up"));
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_workflow() {
        let engine = test_engine();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in_step = attempts.clone();

        engine
            .register(
                WorkflowDefinition::new("w", "Doomed").step(
                    WorkflowStep::handler_fn("a", "A", move |_s| {
                        let attempts = attempts_in_step.clone();
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            Err(CoreError::Handler("always fails".to_string()))
                        }
                    })
                    .retries(2),
                ),
            )
            .await;

        let result = engine.execute("w", json!({})).await.unwrap();
        assert!(!result.success);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let a = &result.step_results[0];
        assert_eq!(a.status, StepStatus::Failed);
        assert_eq!(a.retries, 2);

        let context = engine.get_execution(&result.execution_id).await.unwrap();
        assert_eq!(context.status, WorkflowStatus::Failed);
        assert!(context.completed_at.is_some());
    }

    struct Absorb;

    #[async_trait]
    impl RecoveryHook for Absorb {
        async fn recover(&self, _error: &CoreError, scope: StepScope) -> Result<(), CoreError> {
            scope.set_variable("recovered", json!(true)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_recovery_hook_absorbs_failure() {
        let engine = test_engine();
        engine
            .register(
                WorkflowDefinition::new("w", "Recoverable")
                    .step(
                        WorkflowStep::handler_fn("a", "A", |_s| async {
                            Err(CoreError::Handler("flaky".to_string()))
                        })
                        .on_error(Absorb),
                    )
                    .step(WorkflowStep::handler_fn("b", "B", |_s| async { Ok(json!("ran")) })),
            )
            .await;

        let result = engine.execute("w", json!({})).await.unwrap();
        // The failed step stays failed, but the walk continued.
        assert!(result.success);
        assert_eq!(result.step_results[0].status, StepStatus::Failed);
        assert_eq!(result.step_results[1].status, StepStatus::Completed);

        let context = engine.get_execution(&result.execution_id).await.unwrap();
        assert_eq!(context.variables.get("recovered"), Some(&json!(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_is_a_distinct_failure() {
        let engine = test_engine();
        let mut timeouts = engine.events().subscribe("step.timeout").await;

        engine
            .register(
                WorkflowDefinition::new("w", "Slow").step(
                    WorkflowStep::handler_fn("a", "A", |_s| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(json!(null))
                    })
                    .timeout(Duration::from_millis(50)),
                ),
            )
            .await;

        let result = engine.execute("w", json!({})).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Timed out"));
        let event = timeouts.recv().await.unwrap();
        assert_eq!(event.step_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_pause_resume_continues_at_same_step() {
        let engine = test_engine();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
        let (gate_tx, gate_rx) = mpsc::unbounded_channel::<()>();
        let gate_rx = Arc::new(tokio::sync::Mutex::new(gate_rx));
        let b_runs = Arc::new(AtomicU32::new(0));
        let b_runs_in_step = b_runs.clone();

        engine
            .register(
                WorkflowDefinition::new("w", "Pausable")
                    .step(WorkflowStep::handler_fn("a", "A", move |_s| {
                        let started_tx = started_tx.clone();
                        let gate_rx = gate_rx.clone();
                        async move {
                            let _ = started_tx.send(());
                            gate_rx.lock().await.recv().await;
                            Ok(json!("a"))
                        }
                    }))
                    .step(WorkflowStep::handler_fn("b", "B", move |_s| {
                        let b_runs = b_runs_in_step.clone();
                        async move {
                            b_runs.fetch_add(1, Ordering::SeqCst);
                            Ok(json!("b"))
                        }
                    })),
            )
            .await;

        let runner = engine.clone();
        let execution = tokio::spawn(async move { runner.execute("w", json!({})).await });

        // Pause while step A is in flight, then let A finish.
        started_rx.recv().await.unwrap();
        let execution_id = engine.list_executions(Some("w")).await[0].execution_id.clone();
        assert!(engine.pause(&execution_id).await.unwrap());
        gate_tx.send(()).unwrap();

        // The walk must stop at the boundary: A recorded, B not started.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let context = engine.get_execution(&execution_id).await.unwrap();
        assert_eq!(context.status, WorkflowStatus::Paused);
        assert_eq!(context.step_results["a"].status, StepStatus::Completed);
        assert_eq!(b_runs.load(Ordering::SeqCst), 0);

        assert!(engine.resume(&execution_id).await.unwrap());
        let result = execution.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.step_results.len(), 2);
        assert_eq!(b_runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_after_inflight_step() {
        let engine = test_engine();
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
        let (gate_tx, gate_rx) = mpsc::unbounded_channel::<()>();
        let gate_rx = Arc::new(tokio::sync::Mutex::new(gate_rx));
        let b_runs = Arc::new(AtomicU32::new(0));
        let b_runs_in_step = b_runs.clone();

        engine
            .register(
                WorkflowDefinition::new("w", "Cancellable")
                    .step(WorkflowStep::handler_fn("a", "A", move |_s| {
                        let started_tx = started_tx.clone();
                        let gate_rx = gate_rx.clone();
                        async move {
                            let _ = started_tx.send(());
                            gate_rx.lock().await.recv().await;
                            Ok(json!("a"))
                        }
                    }))
                    .step(WorkflowStep::handler_fn("b", "B", move |_s| {
                        let b_runs = b_runs_in_step.clone();
                        async move {
                            b_runs.fetch_add(1, Ordering::SeqCst);
                            Ok(json!("b"))
                        }
                    })),
            )
            .await;

        let runner = engine.clone();
        let execution = tokio::spawn(async move { runner.execute("w", json!({})).await });

        started_rx.recv().await.unwrap();
        let execution_id = engine.list_executions(Some("w")).await[0].execution_id.clone();
        assert!(engine.cancel(&execution_id).await.unwrap());
        gate_tx.send(()).unwrap();

        let result = execution.await.unwrap().unwrap();
        assert!(!result.success);
        // The in-flight step finished; nothing after it ran.
        assert_eq!(result.step_results.len(), 1);
        assert_eq!(result.step_results[0].status, StepStatus::Completed);
        assert_eq!(b_runs.load(Ordering::SeqCst), 0);

        let context = engine.get_execution(&execution_id).await.unwrap();
        assert_eq!(context.status, WorkflowStatus::Cancelled);
        // Cancel again: terminal, so the transition is refused.
        assert!(!engine.cancel(&execution_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_control_calls_on_unknown_execution() {
        let engine = test_engine();
        assert!(matches!(engine.pause("nope").await, Err(CoreError::NotFound(_))));
        assert!(matches!(engine.resume("nope").await, Err(CoreError::NotFound(_))));
        assert!(matches!(engine.cancel("nope").await, Err(CoreError::NotFound(_))));
        assert!(engine.get_execution("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_pause_on_terminal_execution_is_refused() {
        let engine = test_engine();
        engine
            .register(
                WorkflowDefinition::new("w", "Tiny")
                    .step(WorkflowStep::handler_fn("a", "A", |_s| async { Ok(json!(null)) })),
            )
            .await;
        let result = engine.execute("w", json!({})).await.unwrap();
        assert!(!engine.pause(&result.execution_id).await.unwrap());
        assert!(!engine.resume(&result.execution_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_executions_filters_by_workflow() {
        let engine = test_engine();
        for id in ["w1", "w2"] {
            engine
                .register(
                    WorkflowDefinition::new(id, id)
                        .step(WorkflowStep::handler_fn("a", "A", |_s| async { Ok(json!(null)) })),
                )
                .await;
            engine.execute(id, json!({})).await.unwrap();
        }
        assert_eq!(engine.list_executions(None).await.len(), 2);
        let only_w1 = engine.list_executions(Some("w1")).await;
        assert_eq!(only_w1.len(), 1);
        assert_eq!(only_w1[0].workflow_id, "w1");
    }

    // Real time on purpose: cleanup ages executions by wall-clock
    // timestamps, not the tokio test clock.
    #[tokio::test]
    async fn test_cleanup_removes_old_executions() {
        let engine = test_engine();
        engine
            .register(
                WorkflowDefinition::new("w", "Tiny")
                    .step(WorkflowStep::handler_fn("a", "A", |_s| async { Ok(json!(null)) })),
            )
            .await;
        let result = engine.execute("w", json!({})).await.unwrap();

        // Too young to reap.
        assert_eq!(engine.cleanup(Duration::from_secs(3600)).await, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.cleanup(Duration::from_millis(5)).await, 1);
        assert!(engine.get_execution(&result.execution_id).await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_and_reregister() {
        let engine = test_engine();
        engine.register(WorkflowDefinition::new("w", "First")).await;
        engine.register(WorkflowDefinition::new("w", "Second")).await;
        assert_eq!(engine.get_workflow("w").await.unwrap().name, "Second");
        assert!(engine.unregister("w").await);
        assert!(!engine.unregister("w").await);
        assert!(engine.get_workflow("w").await.is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_walk_order() {
        let engine = test_engine();
        let mut events = engine.events().subscribe("*").await;

        engine
            .register(
                WorkflowDefinition::new("w", "Observed")
                    .step(WorkflowStep::handler_fn("a", "A", |_s| async { Ok(json!(null)) }))
                    .step(
                        WorkflowStep::handler_fn("b", "B", |_s| async { Ok(json!(null)) })
                            .condition(|_ctx: &WorkflowContext| -> Result<bool, CoreError> {
                                Ok(false)
                            }),
                    ),
            )
            .await;
        engine.execute("w", json!({})).await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(
            kinds,
            vec![
                EventKind::WorkflowStarted,
                EventKind::StepStarted,
                EventKind::StepCompleted,
                EventKind::StepSkipped,
                EventKind::WorkflowCompleted,
            ]
        );
    }
}
