//! # Workflow Coordinator
//!
//! Runs one step invocation through `Validating → Loading → Executing →
//! Succeeded | Failed` and turns the result into a structured [`StepOutcome`].
//!
//! ## Failure policy
//!
//! - Validation errors fail fast before any I/O.
//! - A step that fails is a normal outcome: the failure is written into the
//!   workflow state best-effort, retry advice is computed, and the redirect
//!   engine picks a corrective step if a rule exists.
//! - A step that succeeds but whose completion cannot be saved is an error
//!   returned to the caller.
//!
//! The session lock is held from loading to the final save, so invocations on
//! one session are serialized while different sessions run in parallel.

use crate::config::EngineConfig;
use crate::constants::{events, params, WorkflowStatus, SESSION_ID_PREFIX};
use crate::error::{EngineError, EngineResult};
use crate::logging::{log_error, log_step_operation};
use crate::models::{WorkflowError, WorkflowState};
use crate::orchestration::metrics::WorkflowMetrics;
use crate::orchestration::redirect::{FailureInput, RedirectDecisionEngine, RedirectTable};
use crate::orchestration::retry_advisor::RetryAdvisor;
use crate::orchestration::retry_policy::RetryPolicyTable;
use crate::orchestration::step_executor::{StepContext, StepFailure, StepRegistry};
use crate::orchestration::step_sequence::StepSequence;
use crate::orchestration::types::{
    StepFailureReport, StepOutcome, StepRequest, StepStatusEntry, StepSuccess, WorkflowStart,
    WorkflowStatusReport,
};
use crate::orchestration::validation;
use crate::state::{SessionLockGuard, WorkflowStateManager};
use crate::store::{self, SessionStore};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct WorkflowCoordinator {
    manager: Arc<WorkflowStateManager>,
    sequence: StepSequence,
    advisor: RetryAdvisor,
    redirects: RedirectDecisionEngine,
    steps: StepRegistry,
    metrics: Arc<WorkflowMetrics>,
}

impl WorkflowCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        steps: StepRegistry,
        config: &EngineConfig,
        metrics: Arc<WorkflowMetrics>,
    ) -> Self {
        let manager = Arc::new(WorkflowStateManager::new(
            store,
            config.locking.acquire_timeout(),
            Arc::clone(&metrics),
        ));
        let redirects = RedirectDecisionEngine::new(
            RedirectTable::builtin(),
            Arc::clone(&manager),
            Arc::clone(&metrics),
            config.redirect.alternation_threshold,
        );
        Self {
            manager,
            sequence: StepSequence::canonical(),
            advisor: RetryAdvisor::new(RetryPolicyTable::from_config(&config.retry)),
            redirects,
            steps,
            metrics,
        }
    }

    /// Validate `config`, connect the configured store and build a coordinator
    pub async fn bootstrap(config: &EngineConfig, steps: StepRegistry) -> EngineResult<Self> {
        config.validate()?;
        let store = store::connect(config).await?;
        info!(
            backend = ?config.store.backend,
            executors = steps.len(),
            "Workflow coordinator ready"
        );
        Ok(Self::new(store, steps, config, Arc::new(WorkflowMetrics::new())))
    }

    /// Replace the built-in redirect rules
    pub fn with_redirect_table(mut self, table: RedirectTable) -> Self {
        self.redirects = RedirectDecisionEngine::new(
            table,
            Arc::clone(&self.manager),
            Arc::clone(&self.metrics),
            self.redirects.alternation_threshold(),
        );
        self
    }

    pub fn manager(&self) -> &Arc<WorkflowStateManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<WorkflowMetrics> {
        &self.metrics
    }

    pub fn sequence(&self) -> &StepSequence {
        &self.sequence
    }

    pub fn advisor(&self) -> &RetryAdvisor {
        &self.advisor
    }

    pub fn redirects(&self) -> &RedirectDecisionEngine {
        &self.redirects
    }

    /// Create a session for a new pipeline run.
    ///
    /// The session id is returned even if the initial state could not be
    /// written; `persisted` reports which happened.
    #[instrument(skip(self, cancel), fields(repo_path = %repo_path))]
    pub async fn start_workflow(
        &self,
        repo_path: &str,
        skip_steps: Vec<String>,
        cancel: &CancellationToken,
    ) -> EngineResult<WorkflowStart> {
        validation::validate_repo_path(repo_path)?;
        if let Some(unknown) = skip_steps.iter().find(|s| !self.sequence.contains(s)) {
            return Err(EngineError::validation(format!(
                "cannot skip unknown step: {unknown}"
            )));
        }

        let session_id = format!("{SESSION_ID_PREFIX}{}", Uuid::new_v4());
        let mut initial = WorkflowState::new(session_id.clone());
        initial.repo_path = repo_path.to_string();
        initial.status = WorkflowStatus::Running;
        initial.current_step = self.sequence.first().to_string();
        initial.skip_steps = skip_steps.clone();
        initial.metadata.workflow_id = session_id.clone();
        initial.metadata.version = env!("CARGO_PKG_VERSION").to_string();
        initial.metadata.started_at = Some(Utc::now());

        let state = initial.clone();
        let persisted = match self
            .manager
            .update(&session_id, cancel, move |current| {
                *current = state;
                Ok(())
            })
            .await
        {
            Ok(_) => true,
            Err(e @ EngineError::Cancelled { .. }) => return Err(e),
            Err(e) => {
                self.metrics.record_persistence_failure();
                log_error("coordinator", "start_workflow", &e.to_string(), Some(&session_id));
                false
            }
        };

        log_step_operation(
            events::WORKFLOW_STARTED,
            &session_id,
            self.sequence.first(),
            1,
            if persisted { "ok" } else { "unpersisted" },
            Some(repo_path),
        );

        Ok(WorkflowStart {
            session_id,
            status: initial.status,
            current_step: initial.current_step,
            skip_steps,
            persisted,
        })
    }

    /// Progress of an existing session over the canonical sequence
    pub async fn workflow_status(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<WorkflowStatusReport> {
        if session_id.trim().is_empty() {
            return Err(EngineError::validation(format!(
                "{} is required",
                params::SESSION_ID
            )));
        }
        let (state, _session) = self.manager.load_existing(session_id, cancel).await?;

        let steps = self
            .sequence
            .definitions()
            .iter()
            .map(|definition| StepStatusEntry {
                step: definition.name.to_string(),
                label: definition.label.to_string(),
                status: state.step_status(definition.name),
            })
            .collect();

        let next_step = if state.status.is_terminal() {
            None
        } else {
            self.sequence
                .names()
                .find(|name| !state.is_step_completed(name) && !state.is_step_skipped(name))
                .map(str::to_string)
        };

        Ok(WorkflowStatusReport {
            session_id: state.session_id,
            status: state.status,
            current_step: state.current_step,
            completed_steps: state.completed_steps,
            failed_steps: state.failed_steps,
            skip_steps: state.skip_steps,
            steps,
            next_step,
            error: state.error,
        })
    }

    /// Run one step.
    ///
    /// Returns `Err` for invalid requests, cancellation, lock timeouts, a
    /// failed load, or a success that could not be saved. A failing step is
    /// `Ok(StepOutcome::Failed)`.
    #[instrument(skip(self, request, cancel), fields(step = %request.step, session_id = %request.session_id, attempt = request.attempt))]
    pub async fn execute_step(
        &self,
        request: StepRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<StepOutcome> {
        // Validating
        validation::validate_step_request(&request, &self.sequence)?;
        let started = Instant::now();
        self.metrics.record_step_started();
        log_step_operation(
            events::STEP_STARTED,
            &request.session_id,
            &request.step,
            request.attempt,
            "started",
            request.fixing.as_ref().map(|f| f.previous_error.as_str()),
        );

        // Loading
        let guard = self.manager.lock(&request.session_id, cancel).await?;
        let mut state = self.manager.load(&request.session_id, cancel).await?;
        if state.repo_path.is_empty() {
            if let Some(repo_path) = request.params.get(params::REPO_PATH).and_then(Value::as_str) {
                state.repo_path = repo_path.to_string();
            }
        }

        if let Some(message) = self.missing_prerequisites(&request.step, &state) {
            debug!(step = %request.step, %message, "Prerequisites missing");
            return self
                .record_failure(&guard, &request, state, StepFailure::new(message), cancel)
                .await;
        }

        let Some(executor) = self.steps.get(&request.step) else {
            let failure = StepFailure::new(format!(
                "no executor registered for step {}",
                request.step
            ));
            return self
                .record_failure(&guard, &request, state, failure, cancel)
                .await;
        };

        // Executing
        let context = StepContext {
            session_id: request.session_id.clone(),
            step: request.step.clone(),
            params: request.params.clone(),
            attempt: request.attempt,
            fixing: request.fixing.clone(),
            cancel: cancel.clone(),
        };
        let mut working = state.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(EngineError::cancelled(format!("execute {}", request.step)));
            }
            result = executor.execute(&context, &mut working) => result,
        };

        match result {
            Ok(output) => {
                let outcome = self
                    .record_success(&request, working, output.message, output.data, cancel)
                    .await?;
                log_step_operation(
                    events::STEP_COMPLETED,
                    &request.session_id,
                    &request.step,
                    request.attempt,
                    "completed",
                    Some(&format!("{}ms", started.elapsed().as_millis())),
                );
                Ok(outcome)
            }
            // step mutations are discarded on failure
            Err(failure) => {
                self.record_failure(&guard, &request, state, failure, cancel)
                    .await
            }
        }
    }

    /// "`<producer>` must be run first" for every required artifact not present
    fn missing_prerequisites(&self, step: &str, state: &WorkflowState) -> Option<String> {
        let definition = self.sequence.definition(step)?;
        let mut producers: Vec<&str> = Vec::new();
        for prerequisite in definition.requires {
            if !state.artifacts.contains(prerequisite.artifact)
                && !producers.contains(&prerequisite.producer)
            {
                producers.push(prerequisite.producer);
            }
        }
        if producers.is_empty() {
            None
        } else {
            Some(format!("{} must be run first", producers.join(" and ")))
        }
    }

    async fn record_success(
        &self,
        request: &StepRequest,
        mut state: WorkflowState,
        message: Option<String>,
        data: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> EngineResult<StepOutcome> {
        state.mark_step_completed(&request.step);
        state.clear_error();

        // current_step is the last step touched; the next one is only reported
        let next_step = self.sequence.next_pending(&request.step, &state.skip_steps);
        state.current_step = request.step.clone();
        state.status = if next_step.is_some() {
            WorkflowStatus::Running
        } else {
            WorkflowStatus::Completed
        };

        self.manager.save(&state, cancel).await.inspect_err(|e| {
            log_error(
                "coordinator",
                "save_step_success",
                &e.to_string(),
                Some(&request.session_id),
            );
        })?;
        self.metrics.record_step_succeeded();

        if state.status == WorkflowStatus::Completed {
            info!(session_id = %request.session_id, "Workflow completed");
            log_step_operation(
                events::WORKFLOW_COMPLETED,
                &request.session_id,
                &request.step,
                request.attempt,
                "completed",
                None,
            );
        }

        Ok(StepOutcome::Succeeded(StepSuccess {
            session_id: request.session_id.clone(),
            step: request.step.clone(),
            next_step: next_step.map(str::to_string),
            workflow_status: state.status,
            completed_steps: state.completed_steps,
            progress: self.sequence.progress(&request.step),
            message,
            data,
        }))
    }

    async fn record_failure(
        &self,
        guard: &SessionLockGuard,
        request: &StepRequest,
        mut state: WorkflowState,
        failure: StepFailure,
        cancel: &CancellationToken,
    ) -> EngineResult<StepOutcome> {
        self.metrics.record_step_failed(&request.step);
        log_step_operation(
            events::STEP_FAILED,
            &request.session_id,
            &request.step,
            request.attempt,
            "failed",
            Some(&failure.message),
        );

        state.mark_step_failed(&request.step);
        state.current_step = request.step.clone();
        state.set_error(WorkflowError::new(
            &request.step,
            request.attempt,
            &failure.message,
        ));

        let state_persisted = match self.manager.save(&state, cancel).await {
            Ok(_) => true,
            Err(e) => {
                self.metrics.record_persistence_failure();
                log_error(
                    "coordinator",
                    "save_step_failure",
                    &e.to_string(),
                    Some(&request.session_id),
                );
                false
            }
        };

        let retry = self
            .advisor
            .advise(&request.step, &failure.message, request.attempt);

        let redirect = self
            .redirects
            .decide_locked(
                guard,
                FailureInput {
                    session_id: &request.session_id,
                    failed_step: &request.step,
                    error: &failure.message,
                    attempt: request.attempt,
                    step_data: &failure.data,
                },
                cancel,
            )
            .await?;

        if let Some(decision) = &redirect {
            log_step_operation(
                if decision.alternated {
                    events::REDIRECT_ALTERNATED
                } else {
                    events::REDIRECT_ISSUED
                },
                &request.session_id,
                &request.step,
                request.attempt,
                "redirect",
                Some(&decision.redirect_to),
            );
        } else if !retry.retryable {
            warn!(
                session_id = %request.session_id,
                step = %request.step,
                error = %failure.message,
                "Step failed with no corrective action"
            );
        }

        Ok(StepOutcome::Failed(StepFailureReport {
            session_id: request.session_id.clone(),
            step: request.step.clone(),
            error: failure.message,
            attempt: request.attempt,
            retry,
            redirect,
            state_persisted,
            data: failure.data,
        }))
    }
}
