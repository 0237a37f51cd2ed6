//! # Orchestration
//!
//! Step sequencing, retry advice, redirects and the coordinator that ties
//! them to the persisted workflow state.
//!
//! ## Components
//!
//! - [`step_sequence`]: the fixed pipeline order and step prerequisites
//! - [`retry_policy`] and [`backoff_calculator`]: per-step retry limits and delays
//! - [`retry_advisor`]: retry advice for a failed attempt
//! - [`redirect`]: corrective-step selection with deploy anti-thrash alternation
//! - [`step_executor`]: the capability trait steps implement
//! - [`workflow_coordinator`]: the per-invocation state machine
//! - [`metrics`]: injected counters

pub mod backoff_calculator;
pub mod metrics;
pub mod redirect;
pub mod retry_advisor;
pub mod retry_policy;
pub mod step_executor;
pub mod step_sequence;
pub mod types;
pub mod validation;
pub mod workflow_coordinator;

pub use metrics::{WorkflowMetrics, WorkflowMetricsSnapshot};
pub use redirect::{
    FailureInput, FixingContext, RedirectDecision, RedirectDecisionEngine, RedirectRule,
    RedirectTable,
};
pub use retry_advisor::{RetryAdvice, RetryAdvisor};
pub use retry_policy::{RetryPolicy, RetryPolicyTable};
pub use step_executor::{StepContext, StepFailure, StepOutput, StepRegistry, WorkflowStep};
pub use step_sequence::{StepDefinition, StepSequence, WORKFLOW_SEQUENCE};
pub use types::{
    FixingRequest, StepFailureReport, StepOutcome, StepRequest, StepStatusEntry, StepSuccess,
    WorkflowStart, WorkflowStatusReport,
};
pub use workflow_coordinator::WorkflowCoordinator;
