//! # Step Executors
//!
//! The engine does not build images or talk to clusters itself. Each pipeline
//! step is an external capability registered as a [`WorkflowStep`]; the
//! coordinator hands it the assembled [`StepContext`] and the session's
//! [`WorkflowState`], and routes its outcome through retry advice and
//! redirects.

use crate::models::WorkflowState;
use crate::orchestration::types::FixingRequest;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a step needs to know about the invocation
#[derive(Debug, Clone)]
pub struct StepContext {
    pub session_id: String,
    pub step: String,
    pub params: Map<String, Value>,
    /// 1-based attempt number for this step
    pub attempt: u32,
    /// Present when this invocation is correcting an earlier failure
    pub fixing: Option<FixingRequest>,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn is_fixing(&self) -> bool {
        self.fixing.is_some()
    }
}

/// Successful step result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub message: Option<String>,
    /// Forwarded to the caller unchanged
    pub data: Map<String, Value>,
}

impl StepOutput {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Domain failure reported by a step. Not an engine error
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub message: String,
    /// Becomes part of the redirect's fixing context
    pub data: Map<String, Value>,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// A pipeline step capability.
///
/// Implementations may read and update `state` (typically to attach the
/// artifact they produce). The coordinator owns status bookkeeping: marking
/// the step completed or failed, `current_step` and the error field.
#[async_trait]
pub trait WorkflowStep: Send + Sync {
    /// Step name this executor handles
    fn name(&self) -> &str;

    async fn execute(
        &self,
        context: &StepContext,
        state: &mut WorkflowState,
    ) -> Result<StepOutput, StepFailure>;
}

/// Executors keyed by step name
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn WorkflowStep>>,
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.steps.keys().collect();
        names.sort();
        f.debug_struct("StepRegistry").field("steps", &names).finish()
    }
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `step` under its own name, replacing any previous executor
    pub fn register(&mut self, step: Arc<dyn WorkflowStep>) -> Option<Arc<dyn WorkflowStep>> {
        self.steps.insert(step.name().to_string(), step)
    }

    pub fn with(mut self, step: Arc<dyn WorkflowStep>) -> Self {
        self.register(step);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WorkflowStep>> {
        self.steps.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
