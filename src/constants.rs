//! # Pipeline Constants
//!
//! Step identifiers, persisted metadata keys and the status enums shared by
//! every layer of the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical step identifiers of the containerization pipeline
pub mod steps {
    pub const ANALYZE_REPOSITORY: &str = "analyze_repository";
    pub const GENERATE_DOCKERFILE: &str = "generate_dockerfile";
    pub const BUILD_IMAGE: &str = "build_image";
    pub const SCAN_IMAGE: &str = "scan_image";
    pub const TAG_IMAGE: &str = "tag_image";
    pub const PUSH_IMAGE: &str = "push_image";
    pub const GENERATE_K8S_MANIFESTS: &str = "generate_k8s_manifests";
    pub const PREPARE_CLUSTER: &str = "prepare_cluster";
    pub const DEPLOY_APPLICATION: &str = "deploy_application";
    pub const VERIFY_DEPLOYMENT: &str = "verify_deployment";
}

/// Keys inside `Session::metadata`
pub mod metadata_keys {
    pub const WORKFLOW_STATE: &str = "workflow_state";
    pub const DEPLOYMENT_FAILURE_TRACKING: &str = "deployment_failure_tracking";
}

/// Request parameter names understood by the coordinator
pub mod params {
    pub const SESSION_ID: &str = "session_id";
    pub const REPO_PATH: &str = "repo_path";
    pub const FIXING_MODE: &str = "fixing_mode";
    pub const PREVIOUS_ERROR: &str = "previous_error";
    pub const FAILED_TOOL: &str = "failed_tool";
    pub const RETRY_NUMBER: &str = "retry_number";
}

/// Event names used in structured log lines
pub mod events {
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const STEP_FAILED: &str = "step.failed";
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const REDIRECT_ISSUED: &str = "redirect.issued";
    pub const REDIRECT_ALTERNATED: &str = "redirect.alternated";
}

/// Prefix for generated session identifiers
pub const SESSION_ID_PREFIX: &str = "wf_";

/// Overall status of one session's pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Initialized,
    Running,
    Error,
    Completed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Initialized => "initialized",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Error => "error",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a persisted status string; `None` for anything unrecognized
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initialized" => Some(WorkflowStatus::Initialized),
            // older records wrote these for a freshly started workflow
            "running" | "started" | "in_progress" => Some(WorkflowStatus::Running),
            "error" => Some(WorkflowStatus::Error),
            "completed" => Some(WorkflowStatus::Completed),
            "cancelled" => Some(WorkflowStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step status as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Completed,
    Failed,
    Skipped,
}
