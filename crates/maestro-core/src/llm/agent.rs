//! `AgentAction` — a workflow step handler that reaches a model through the
//! fallback router.
//!
//! The step output is the serialized [`ChatResponse`], so downstream steps
//! and observers see the answer, the model that produced it, token usage,
//! and whether a fallback substitution occurred.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreError;
use crate::workflow::context::StepScope;
use crate::workflow::schema::StepAction;

use super::router::ModelRouter;
use super::ChatMessage;

pub struct AgentAction {
    router: Arc<ModelRouter>,
    backend: String,
    model: String,
    system_prompt: Option<String>,
    prompt_variable: Option<String>,
}

impl AgentAction {
    pub fn new(router: Arc<ModelRouter>, backend: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            router,
            backend: backend.into(),
            model: model.into(),
            system_prompt: None,
            prompt_variable: None,
        }
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Read the user prompt from this context variable instead of the
    /// execution input — lets an earlier step compose the prompt.
    pub fn prompt_variable(mut self, key: impl Into<String>) -> Self {
        self.prompt_variable = Some(key.into());
        self
    }

    async fn build_prompt(&self, scope: &StepScope) -> Result<String, CoreError> {
        let value = match &self.prompt_variable {
            Some(key) => scope.variable(key).await.ok_or_else(|| {
                CoreError::Handler(format!("prompt variable '{key}' is not set"))
            })?,
            None => scope.input().await,
        };
        Ok(match value {
            Value::String(text) => text,
            other => other.to_string(),
        })
    }
}

#[async_trait]
impl StepAction for AgentAction {
    async fn run(&self, scope: StepScope) -> Result<Value, CoreError> {
        let prompt = self.build_prompt(&scope).await?;

        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(prompt));

        let response = self.router.chat(&messages, &self.backend, &self.model).await?;
        serde_json::to_value(&response).map_err(|e| CoreError::Handler(e.to_string()))
    }
}
