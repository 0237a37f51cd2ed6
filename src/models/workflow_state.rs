//! # Workflow State
//!
//! The engine's typed view of one session's pipeline progress. Persisted as a
//! single entry of the session metadata (see [`crate::state::codec`]).
//!
//! `completed_steps` and `failed_steps` never share a step: marking a step one
//! way removes it from the other, so a step can flip status across retries.

use crate::constants::{StepStatus, WorkflowStatus};
use crate::models::artifacts::{Artifact, WorkflowArtifacts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Last step failure recorded on the workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WorkflowError {
    pub fn new(step: impl Into<String>, attempt: u32, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            attempt,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} failed (attempt {}): {}",
            self.step, self.attempt, self.message
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowMetadata {
    pub workflow_id: String,
    pub version: String,
    pub started_at: Option<DateTime<Utc>>,
    pub custom: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowState {
    pub session_id: String,
    pub repo_path: String,
    #[serde(deserialize_with = "lenient_status")]
    pub status: WorkflowStatus,
    pub current_step: String,
    #[serde(deserialize_with = "lenient_string_list")]
    pub completed_steps: Vec<String>,
    #[serde(deserialize_with = "lenient_string_list")]
    pub failed_steps: Vec<String>,
    #[serde(deserialize_with = "lenient_string_list")]
    pub skip_steps: Vec<String>,
    pub artifacts: WorkflowArtifacts,
    pub metadata: WorkflowMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkflowError>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new("")
    }
}

impl WorkflowState {
    /// Fresh state for a session that has no persisted workflow yet
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            repo_path: String::new(),
            status: WorkflowStatus::Initialized,
            current_step: String::new(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skip_steps: Vec::new(),
            artifacts: WorkflowArtifacts::new(),
            metadata: WorkflowMetadata::default(),
            error: None,
        }
    }

    pub fn mark_step_completed(&mut self, step: &str) {
        self.failed_steps.retain(|s| s != step);
        if !self.is_step_completed(step) {
            self.completed_steps.push(step.to_string());
        }
    }

    pub fn mark_step_failed(&mut self, step: &str) {
        self.completed_steps.retain(|s| s != step);
        if !self.is_step_failed(step) {
            self.failed_steps.push(step.to_string());
        }
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    pub fn is_step_failed(&self, step: &str) -> bool {
        self.failed_steps.iter().any(|s| s == step)
    }

    pub fn is_step_skipped(&self, step: &str) -> bool {
        self.skip_steps.iter().any(|s| s == step)
    }

    pub fn step_status(&self, step: &str) -> StepStatus {
        if self.is_step_completed(step) {
            StepStatus::Completed
        } else if self.is_step_failed(step) {
            StepStatus::Failed
        } else if self.is_step_skipped(step) {
            StepStatus::Skipped
        } else {
            StepStatus::NotStarted
        }
    }

    /// Record a failure and move the workflow into the error status
    pub fn set_error(&mut self, error: WorkflowError) {
        self.error = Some(error);
        self.status = WorkflowStatus::Error;
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn set_artifact(&mut self, artifact: Artifact) {
        self.artifacts.insert(artifact);
    }

    pub fn update_artifacts(&mut self, artifacts: WorkflowArtifacts) {
        self.artifacts.merge(artifacts);
    }
}

fn lenient_status<'de, D>(deserializer: D) -> Result<WorkflowStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(match raw.as_deref() {
        None | Some("") => WorkflowStatus::Initialized,
        Some(value) => WorkflowStatus::parse(value).unwrap_or_else(|| {
            warn!(status = %value, "Unknown workflow status, treating as initialized");
            WorkflowStatus::Initialized
        }),
    })
}

/// Non-string entries are dropped rather than failing the whole record
fn lenient_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        })
        .collect())
}
