//! Request and response types of the workflow coordinator.

use crate::constants::{params, StepStatus, WorkflowStatus};
use crate::error::{EngineError, EngineResult};
use crate::models::WorkflowError;
use crate::orchestration::redirect::RedirectDecision;
use crate::orchestration::retry_advisor::RetryAdvice;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Marks an invocation as a correction of an earlier failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixingRequest {
    pub previous_error: String,
    /// Step whose failure is being corrected, when known
    pub failed_step: Option<String>,
}

/// One step invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    pub step: String,
    pub session_id: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub fixing: Option<FixingRequest>,
}

fn default_attempt() -> u32 {
    1
}

impl StepRequest {
    pub fn new(step: impl Into<String>, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let mut params = Map::new();
        params.insert(params::SESSION_ID.to_string(), Value::String(session_id.clone()));
        Self {
            step: step.into(),
            session_id,
            params,
            attempt: 1,
            fixing: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_fixing(mut self, previous_error: impl Into<String>, failed_step: Option<&str>) -> Self {
        self.fixing = Some(FixingRequest {
            previous_error: previous_error.into(),
            failed_step: failed_step.map(str::to_string),
        });
        self
    }

    /// Build a request from a tool-style parameter map.
    ///
    /// Reads `session_id`, and the optional `retry_number`, `fixing_mode`,
    /// `previous_error` and `failed_tool` keys. A missing session id is left
    /// empty for validation to reject.
    pub fn from_params(step: impl Into<String>, params: Map<String, Value>) -> EngineResult<Self> {
        let session_id = optional_str(&params, params::SESSION_ID)?
            .unwrap_or_default()
            .to_string();

        let attempt = match params.get(params::RETRY_NUMBER) {
            None | Some(Value::Null) => 1,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    EngineError::validation(format!(
                        "{} must be a positive integer",
                        params::RETRY_NUMBER
                    ))
                })?,
        };

        let fixing_mode = params
            .get(params::FIXING_MODE)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let previous_error = optional_str(&params, params::PREVIOUS_ERROR)?;
        let failed_step = optional_str(&params, params::FAILED_TOOL)?;

        let fixing = match (fixing_mode, previous_error) {
            (true, error) | (false, error @ Some(_)) => Some(FixingRequest {
                previous_error: error.unwrap_or_default().to_string(),
                failed_step: failed_step.map(str::to_string),
            }),
            (false, None) => None,
        };

        Ok(Self {
            step: step.into(),
            session_id,
            params,
            attempt,
            fixing,
        })
    }
}

fn optional_str<'a>(params: &'a Map<String, Value>, key: &str) -> EngineResult<Option<&'a str>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(EngineError::validation(format!("{key} must be a string"))),
    }
}

/// Result of one step invocation. Step failures are data, not errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded(StepSuccess),
    Failed(StepFailureReport),
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded(_))
    }

    pub fn success(&self) -> Option<&StepSuccess> {
        match self {
            StepOutcome::Succeeded(success) => Some(success),
            StepOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&StepFailureReport> {
        match self {
            StepOutcome::Failed(report) => Some(report),
            StepOutcome::Succeeded(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSuccess {
    pub session_id: String,
    pub step: String,
    /// Next pending step; `None` once the workflow has completed
    pub next_step: Option<String>,
    pub workflow_status: WorkflowStatus,
    pub completed_steps: Vec<String>,
    /// 1-based position of this step and the sequence length
    pub progress: Option<(usize, usize)>,
    pub message: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl StepSuccess {
    pub fn workflow_completed(&self) -> bool {
        self.workflow_status == WorkflowStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailureReport {
    pub session_id: String,
    pub step: String,
    /// Original error text from the step
    pub error: String,
    pub attempt: u32,
    pub retry: RetryAdvice,
    /// Corrective step, if a redirect rule applies
    pub redirect: Option<RedirectDecision>,
    /// Whether the failure was recorded in the workflow state
    pub state_persisted: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl StepFailureReport {
    /// Short description of what the caller should do next
    pub fn next_action(&self) -> String {
        match (&self.redirect, self.retry.retryable) {
            (Some(redirect), _) => format!("run {}", redirect.redirect_to),
            (None, true) => format!("retry {}", self.step),
            (None, false) => "no further action".to_string(),
        }
    }
}

/// Returned by `start_workflow`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStart {
    pub session_id: String,
    pub status: WorkflowStatus,
    pub current_step: String,
    pub skip_steps: Vec<String>,
    /// False when the initial state could not be written
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatusEntry {
    pub step: String,
    pub label: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub session_id: String,
    pub status: WorkflowStatus,
    pub current_step: String,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skip_steps: Vec<String>,
    pub steps: Vec<StepStatusEntry>,
    pub next_step: Option<String>,
    pub error: Option<WorkflowError>,
}

impl WorkflowStatusReport {
    /// Completed steps over steps that are not skipped
    pub fn completion_ratio(&self) -> f64 {
        let relevant = self
            .steps
            .iter()
            .filter(|s| s.status != StepStatus::Skipped)
            .count();
        if relevant == 0 {
            return 1.0;
        }
        let done = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        done as f64 / relevant as f64
    }
}
