//! # Redirect Decision Engine
//!
//! Routes a failed step to a corrective step instead of surfacing a bare
//! error. Most rules are static. The deploy rule also has an alternate target:
//! after `alternation_threshold` consecutive redirects to the default target
//! the engine switches to the alternate once and resets the default's counter,
//! so a session cannot loop down one corrective path forever.
//!
//! The per-session [`DeploymentFailureTracking`] record lives in session
//! metadata. Reading and writing it is best-effort: a read failure falls back
//! to the default target and a write failure is logged, neither blocks the
//! decision.
//!
//! The engine produces structured [`FixingContext`]; rendering guidance text
//! from it is left to the caller.

use crate::constants::steps;
use crate::error::{EngineError, EngineResult};
use crate::logging::{log_error, log_redirect_decision};
use crate::models::DeploymentFailureTracking;
use crate::orchestration::metrics::WorkflowMetrics;
use crate::state::{SessionLockGuard, WorkflowStateManager};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Consecutive redirects to the default target before switching
pub const DEFAULT_ALTERNATION_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    pub redirect_target: String,
    /// Used instead of `redirect_target` once the threshold is reached
    pub alternate_target: Option<String>,
    pub max_redirects: u32,
    pub reason: String,
    pub alternate_reason: Option<String>,
}

impl RedirectRule {
    pub fn new(target: &str, reason: &str) -> Self {
        Self {
            redirect_target: target.to_string(),
            alternate_target: None,
            max_redirects: 1,
            reason: reason.to_string(),
            alternate_reason: None,
        }
    }

    pub fn with_alternate(mut self, target: &str, reason: &str) -> Self {
        self.alternate_target = Some(target.to_string());
        self.alternate_reason = Some(reason.to_string());
        self
    }

    /// Reason shown for a redirect to `target`
    pub fn reason_for(&self, target: &str) -> &str {
        match (&self.alternate_target, &self.alternate_reason) {
            (Some(alternate), Some(reason)) if alternate == target => reason,
            _ => &self.reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedirectTable {
    rules: HashMap<String, RedirectRule>,
}

impl Default for RedirectTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RedirectTable {
    pub fn builtin() -> Self {
        let rules = [
            (
                steps::BUILD_IMAGE,
                RedirectRule::new(
                    steps::GENERATE_DOCKERFILE,
                    "Build failures often indicate Dockerfile issues - regenerate with AI fixing",
                ),
            ),
            (
                steps::DEPLOY_APPLICATION,
                RedirectRule::new(
                    steps::GENERATE_K8S_MANIFESTS,
                    "Deployment failures often indicate manifest issues - regenerate with AI fixing",
                )
                .with_alternate(
                    steps::GENERATE_DOCKERFILE,
                    "Multiple deployment failures detected - rebuilding container image to fix potential image issues",
                ),
            ),
            (
                steps::PUSH_IMAGE,
                RedirectRule::new(
                    steps::BUILD_IMAGE,
                    "Push failures may indicate image issues - rebuild with different settings",
                ),
            ),
            (
                steps::SCAN_IMAGE,
                RedirectRule::new(
                    steps::GENERATE_DOCKERFILE,
                    "Scan failures may indicate Dockerfile issues - regenerate with AI fixing",
                ),
            ),
            (
                steps::VERIFY_DEPLOYMENT,
                RedirectRule::new(
                    steps::DEPLOY_APPLICATION,
                    "Verification failures may indicate deployment issues - retry deployment",
                ),
            ),
        ]
        .into_iter()
        .map(|(step, rule)| (step.to_string(), rule))
        .collect();

        Self { rules }
    }

    pub fn empty() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    pub fn with_rule(mut self, failed_step: &str, rule: RedirectRule) -> Self {
        self.rules.insert(failed_step.to_string(), rule);
        self
    }

    pub fn rule_for(&self, failed_step: &str) -> Option<&RedirectRule> {
        self.rules.get(failed_step)
    }

    /// The rule for `failed_step`, or [`EngineError::RedirectNotConfigured`]
    pub fn require(&self, failed_step: &str) -> EngineResult<&RedirectRule> {
        self.rule_for(failed_step)
            .ok_or_else(|| EngineError::RedirectNotConfigured {
                step: failed_step.to_string(),
            })
    }
}

/// Target chosen for one failure and whether alternation fired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetChoice {
    pub target: String,
    pub alternated: bool,
}

/// Pick the redirect target for an alternating rule and record it in `tracking`
pub fn choose_alternating_target(
    rule: &RedirectRule,
    tracking: &mut DeploymentFailureTracking,
    threshold: u32,
    error: &str,
) -> TargetChoice {
    let default_target = rule.redirect_target.as_str();
    let (target, alternated) = match &rule.alternate_target {
        Some(alternate) if tracking.consecutive(default_target) >= threshold => {
            tracking.reset(default_target);
            (alternate.clone(), true)
        }
        _ => (default_target.to_string(), false),
    };
    tracking.record(&target, error);
    TargetChoice { target, alternated }
}

/// Context handed to whatever renders corrective guidance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixingContext {
    pub session_id: String,
    pub failed_step: String,
    pub redirect_to: String,
    pub previous_error: String,
    pub attempt: u32,
    pub fixing_mode: bool,
    /// Why this corrective step was chosen
    pub fixing_strategy: String,
    pub consecutive_failures: u32,
    pub total_attempts: u32,
    #[serde(default)]
    pub step_data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectDecision {
    pub failed_step: String,
    pub redirect_to: String,
    pub reason: String,
    pub alternated: bool,
    pub max_redirects: u32,
    /// Whether the updated failure tracking was written
    pub tracking_persisted: bool,
    pub fixing_context: FixingContext,
}

/// Inputs describing the failure being redirected
#[derive(Debug, Clone, Copy)]
pub struct FailureInput<'a> {
    pub session_id: &'a str,
    pub failed_step: &'a str,
    pub error: &'a str,
    pub attempt: u32,
    pub step_data: &'a Map<String, Value>,
}

#[derive(Debug)]
pub struct RedirectDecisionEngine {
    table: RedirectTable,
    manager: Arc<WorkflowStateManager>,
    metrics: Arc<WorkflowMetrics>,
    alternation_threshold: u32,
}

impl RedirectDecisionEngine {
    pub fn new(
        table: RedirectTable,
        manager: Arc<WorkflowStateManager>,
        metrics: Arc<WorkflowMetrics>,
        alternation_threshold: u32,
    ) -> Self {
        Self {
            table,
            manager,
            metrics,
            alternation_threshold,
        }
    }

    pub fn table(&self) -> &RedirectTable {
        &self.table
    }

    pub fn alternation_threshold(&self) -> u32 {
        self.alternation_threshold
    }

    /// Decide the redirect for a failure, taking the session lock while the
    /// tracking record is read and written.
    ///
    /// `Ok(None)` means no rule exists for the step. Only cancellation is
    /// returned as an error.
    pub async fn decide(
        &self,
        failure: FailureInput<'_>,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<RedirectDecision>> {
        let Some(rule) = self.table.rule_for(failure.failed_step) else {
            return Ok(None);
        };
        if rule.alternate_target.is_none() {
            return Ok(Some(self.static_decision(rule, &failure)));
        }

        match self.manager.lock(failure.session_id, cancel).await {
            Ok(guard) => self.decide_locked(&guard, failure, cancel).await,
            Err(e @ EngineError::Cancelled { .. }) => Err(e),
            Err(e) => {
                log_error(
                    "redirect",
                    "lock_failure_tracking",
                    &e.to_string(),
                    Some(failure.session_id),
                );
                Ok(Some(self.fallback_decision(rule, &failure)))
            }
        }
    }

    /// Same as [`Self::decide`] for a caller already holding the session lock
    pub async fn decide_locked(
        &self,
        guard: &SessionLockGuard,
        failure: FailureInput<'_>,
        cancel: &CancellationToken,
    ) -> EngineResult<Option<RedirectDecision>> {
        if guard.session_id() != failure.session_id {
            return Err(EngineError::validation(format!(
                "lock held for session {} but redirect requested for {}",
                guard.session_id(),
                failure.session_id
            )));
        }
        let Some(rule) = self.table.rule_for(failure.failed_step) else {
            return Ok(None);
        };
        if rule.alternate_target.is_none() {
            return Ok(Some(self.static_decision(rule, &failure)));
        }

        let mut tracking = match self
            .manager
            .failure_tracking(failure.session_id, cancel)
            .await
        {
            Ok(tracking) => tracking,
            Err(e @ EngineError::Cancelled { .. }) => return Err(e),
            Err(e) => {
                log_error(
                    "redirect",
                    "load_failure_tracking",
                    &e.to_string(),
                    Some(failure.session_id),
                );
                return Ok(Some(self.fallback_decision(rule, &failure)));
            }
        };

        let choice = choose_alternating_target(
            rule,
            &mut tracking,
            self.alternation_threshold,
            failure.error,
        );

        let tracking_persisted = match self
            .manager
            .save_failure_tracking(failure.session_id, &tracking, cancel)
            .await
        {
            Ok(_) => true,
            Err(e @ EngineError::Cancelled { .. }) => return Err(e),
            Err(e) => {
                self.metrics.record_persistence_failure();
                log_error(
                    "redirect",
                    "save_failure_tracking",
                    &e.to_string(),
                    Some(failure.session_id),
                );
                false
            }
        };

        if choice.alternated {
            warn!(
                session_id = %failure.session_id,
                failed_step = %failure.failed_step,
                redirect_to = %choice.target,
                "Repeated failures down one corrective path, switching target"
            );
        }

        let decision = self.build_decision(
            rule,
            &failure,
            &choice.target,
            choice.alternated,
            tracking.consecutive(&choice.target),
            tracking.total_attempts,
            tracking_persisted,
        );
        Ok(Some(decision))
    }

    /// Current tracking record for a session, without modifying it
    pub async fn failure_tracking(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<DeploymentFailureTracking> {
        self.manager.failure_tracking(session_id, cancel).await
    }

    fn static_decision(&self, rule: &RedirectRule, failure: &FailureInput<'_>) -> RedirectDecision {
        self.build_decision(rule, failure, &rule.redirect_target, false, 0, 0, true)
    }

    /// Decision computed against a fresh tracking record that is never saved
    fn fallback_decision(&self, rule: &RedirectRule, failure: &FailureInput<'_>) -> RedirectDecision {
        debug!(
            session_id = %failure.session_id,
            failed_step = %failure.failed_step,
            "Failure tracking unavailable, counting against a fresh record"
        );
        let mut tracking = DeploymentFailureTracking::default();
        let choice = choose_alternating_target(
            rule,
            &mut tracking,
            self.alternation_threshold,
            failure.error,
        );
        self.build_decision(
            rule,
            failure,
            &choice.target,
            choice.alternated,
            tracking.consecutive(&choice.target),
            tracking.total_attempts,
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build_decision(
        &self,
        rule: &RedirectRule,
        failure: &FailureInput<'_>,
        target: &str,
        alternated: bool,
        consecutive_failures: u32,
        total_attempts: u32,
        tracking_persisted: bool,
    ) -> RedirectDecision {
        self.metrics.record_redirect(alternated);
        log_redirect_decision(
            failure.session_id,
            failure.failed_step,
            target,
            consecutive_failures,
            total_attempts,
            alternated,
        );

        let reason = rule.reason_for(target).to_string();
        RedirectDecision {
            failed_step: failure.failed_step.to_string(),
            redirect_to: target.to_string(),
            reason: reason.clone(),
            alternated,
            max_redirects: rule.max_redirects,
            tracking_persisted,
            fixing_context: FixingContext {
                session_id: failure.session_id.to_string(),
                failed_step: failure.failed_step.to_string(),
                redirect_to: target.to_string(),
                previous_error: failure.error.to_string(),
                attempt: failure.attempt,
                fixing_mode: true,
                fixing_strategy: reason,
                consecutive_failures,
                total_attempts,
                step_data: failure.step_data.clone(),
            },
        }
    }
}
