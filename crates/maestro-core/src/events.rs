//! Lifecycle event bus — explicit pub/sub injected into the engine.
//!
//! The engine reports every workflow and step transition here. Topics are
//! strings derived from the event kind; subscribing to `"*"` receives
//! everything, which is what tests and UIs usually want.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

/// Named lifecycle signals emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    StepQueued,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetried,
    StepSkipped,
    StepTimedOut,
    /// Reserved for branch/merge style steps; the linear engine never emits it.
    BranchMerged,
}

impl EventKind {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::StepQueued => "step.queued",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::StepRetried => "step.retried",
            Self::StepSkipped => "step.skipped",
            Self::StepTimedOut => "step.timeout",
            Self::BranchMerged => "workflow.branch_merged",
        }
    }
}

/// Payload carried by every emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub kind: EventKind,
    pub workflow_id: String,
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(kind: EventKind, workflow_id: &str, execution_id: &str) -> Self {
        Self {
            kind,
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
            step_id: None,
            data: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn step(mut self, step_id: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// In-process publish/subscribe bus with string-keyed topics.
///
/// Cheap to clone; all clones share the subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<EventEnvelope>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic (see [`EventKind::topic`]); `"*"` matches all.
    pub async fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<EventEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Publish an event to its topic and to wildcard subscribers.
    ///
    /// Subscribers whose receivers have been dropped are pruned here.
    pub async fn publish(&self, event: EventEnvelope) {
        let topic = event.kind.topic();
        let mut subscribers = self.subscribers.write().await;
        for key in [topic, "*"] {
            if let Some(senders) = subscribers.get_mut(key) {
                senders.retain(|tx| tx.send(event.clone()).is_ok());
            }
        }
    }
}
