mod common;

use common::{coordinator_with, full_registry, registry_with, ScriptedStep};
use containerflow::constants::{params, steps, StepStatus, WorkflowStatus};
use containerflow::error::EngineError;
use containerflow::orchestration::{
    RedirectRule, RedirectTable, StepOutcome, StepRequest, WorkflowCoordinator,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn run(
    coordinator: &WorkflowCoordinator,
    session_id: &str,
    step: &str,
    cancel: &CancellationToken,
) -> StepOutcome {
    let mut request = StepRequest::new(step, session_id);
    if step == steps::ANALYZE_REPOSITORY {
        request = request.with_param(params::REPO_PATH, "/src/app");
    }
    coordinator.execute_step(request, cancel).await.unwrap()
}

async fn run_until(
    coordinator: &WorkflowCoordinator,
    session_id: &str,
    last: &str,
    cancel: &CancellationToken,
) {
    for step in common::all_steps() {
        let outcome = run(coordinator, session_id, step, cancel).await;
        assert!(outcome.is_success(), "{step} failed: {outcome:?}");
        if step == last {
            break;
        }
    }
}

#[tokio::test]
async fn full_pipeline_completes() {
    let coordinator = coordinator_with(full_registry());
    let cancel = CancellationToken::new();
    let start = coordinator
        .start_workflow("/src/app", Vec::new(), &cancel)
        .await
        .unwrap();

    let mut next = Some(start.current_step.clone());
    let mut executed = Vec::new();
    while let Some(step) = next {
        let outcome = run(&coordinator, &start.session_id, &step, &cancel).await;
        let success = outcome.success().unwrap().clone();
        executed.push(step);
        next = success.next_step.clone();
        if next.is_none() {
            assert!(success.workflow_completed());
        }
    }
    assert_eq!(executed, common::all_steps());

    let report = coordinator
        .workflow_status(&start.session_id, &cancel)
        .await
        .unwrap();
    assert_eq!(report.status, WorkflowStatus::Completed);
    assert_eq!(report.next_step, None);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!((report.completion_ratio() - 1.0).abs() < f64::EPSILON);

    let snapshot = coordinator.metrics().snapshot();
    assert_eq!(snapshot.steps_succeeded, 10);
    assert_eq!(snapshot.steps_failed, 0);
}

#[tokio::test]
async fn skipped_steps_are_not_suggested_next() {
    let coordinator = coordinator_with(full_registry());
    let cancel = CancellationToken::new();
    let start = coordinator
        .start_workflow(
            "/src/app",
            vec![steps::SCAN_IMAGE.to_string(), steps::TAG_IMAGE.to_string()],
            &cancel,
        )
        .await
        .unwrap();

    run_until(&coordinator, &start.session_id, steps::GENERATE_DOCKERFILE, &cancel).await;
    let outcome = run(&coordinator, &start.session_id, steps::BUILD_IMAGE, &cancel).await;
    assert_eq!(
        outcome.success().unwrap().next_step.as_deref(),
        Some(steps::PUSH_IMAGE)
    );

    let report = coordinator
        .workflow_status(&start.session_id, &cancel)
        .await
        .unwrap();
    let scan = report.steps.iter().find(|s| s.step == steps::SCAN_IMAGE).unwrap();
    assert_eq!(scan.status, StepStatus::Skipped);
    assert_eq!(report.next_step.as_deref(), Some(steps::PUSH_IMAGE));
}

#[tokio::test]
async fn transient_build_failure_is_retryable_with_backoff() {
    let build = Arc::new(ScriptedStep::failing(
        steps::BUILD_IMAGE,
        &["docker daemon not responding"],
    ));
    let coordinator = coordinator_with(registry_with(Arc::clone(&build)));
    let cancel = CancellationToken::new();
    run_until(&coordinator, "wf_build", steps::GENERATE_DOCKERFILE, &cancel).await;

    let outcome = coordinator
        .execute_step(
            StepRequest::new(steps::BUILD_IMAGE, "wf_build").with_attempt(1),
            &cancel,
        )
        .await
        .unwrap();
    let report = outcome.failure().unwrap();

    assert_eq!(report.error, "docker daemon not responding");
    assert!(report.retry.retryable);
    assert_eq!(report.retry.next_attempt, Some(2));
    assert_eq!(report.retry.max_retries, 3);
    let delay = report.retry.suggested_delay.unwrap();
    assert!(delay >= Duration::from_secs(5), "{delay:?}");
    assert!(delay <= Duration::from_millis(6250), "{delay:?}");

    let redirect = report.redirect.as_ref().unwrap();
    assert_eq!(redirect.redirect_to, steps::GENERATE_DOCKERFILE);
    assert_eq!(redirect.fixing_context.previous_error, "docker daemon not responding");
    assert_eq!(redirect.fixing_context.step_data["attempt"], json!(1));
    assert_eq!(report.next_action(), "run generate_dockerfile");

    let state = coordinator.manager().load("wf_build", &cancel).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Error);
    assert!(state.is_step_failed(steps::BUILD_IMAGE));
    assert_eq!(state.error.as_ref().unwrap().attempt, 1);

    // the retry succeeds and clears the failure
    let retry = coordinator
        .execute_step(
            StepRequest::new(steps::BUILD_IMAGE, "wf_build").with_attempt(2),
            &cancel,
        )
        .await
        .unwrap();
    assert!(retry.is_success());
    let state = coordinator.manager().load("wf_build", &cancel).await.unwrap();
    assert!(state.is_step_completed(steps::BUILD_IMAGE));
    assert!(!state.is_step_failed(steps::BUILD_IMAGE));
    assert!(state.error.is_none());
    assert_eq!(state.status, WorkflowStatus::Running);
    assert_eq!(state.current_step, steps::BUILD_IMAGE);
    assert_eq!(build.calls(), 2);
}

#[tokio::test]
async fn unmatched_scan_failure_is_not_retryable() {
    let scan = Arc::new(ScriptedStep::failing(steps::SCAN_IMAGE, &["authentication failed"]));
    let coordinator = coordinator_with(registry_with(scan));
    let cancel = CancellationToken::new();
    run_until(&coordinator, "wf_scan", steps::BUILD_IMAGE, &cancel).await;

    let outcome = run(&coordinator, "wf_scan", steps::SCAN_IMAGE, &cancel).await;
    let report = outcome.failure().unwrap();
    assert!(!report.retry.retryable);
    assert_eq!(report.retry.next_attempt, None);
    assert_eq!(report.retry.suggested_delay, None);
    assert_eq!(
        report.redirect.as_ref().unwrap().redirect_to,
        steps::GENERATE_DOCKERFILE
    );
}

#[tokio::test]
async fn failure_without_rule_is_a_plain_error() {
    let tag = Arc::new(ScriptedStep::failing(steps::TAG_IMAGE, &["invalid reference format"]));
    let coordinator = coordinator_with(registry_with(tag));
    let cancel = CancellationToken::new();
    run_until(&coordinator, "wf_tag", steps::SCAN_IMAGE, &cancel).await;

    let outcome = run(&coordinator, "wf_tag", steps::TAG_IMAGE, &cancel).await;
    let report = outcome.failure().unwrap();
    assert!(report.redirect.is_none());
    assert!(!report.retry.retryable);
    assert_eq!(report.next_action(), "no further action");
    assert!(RedirectTable::builtin().rule_for("made_up_step").is_none());
}

#[tokio::test]
async fn custom_rule_tables_are_honoured() {
    let push = Arc::new(ScriptedStep::failing(
        steps::PUSH_IMAGE,
        &["manifest unknown: tag not found"],
    ));
    let table = RedirectTable::empty().with_rule(
        steps::PUSH_IMAGE,
        RedirectRule::new(steps::TAG_IMAGE, "retag before pushing"),
    );
    let coordinator = coordinator_with(registry_with(push)).with_redirect_table(table);
    let cancel = CancellationToken::new();
    run_until(&coordinator, "wf_custom", steps::TAG_IMAGE, &cancel).await;

    let outcome = run(&coordinator, "wf_custom", steps::PUSH_IMAGE, &cancel).await;
    let redirect = outcome.failure().unwrap().redirect.clone().unwrap();
    assert_eq!(redirect.redirect_to, steps::TAG_IMAGE);
    assert_eq!(redirect.reason, "retag before pushing");
    assert_eq!(redirect.fixing_context.fixing_strategy, "retag before pushing");
    // built-in rules no longer apply
    assert!(coordinator
        .redirects()
        .table()
        .rule_for(steps::BUILD_IMAGE)
        .is_none());
}

#[tokio::test]
async fn missing_executor_fails_through_normal_path() {
    let coordinator = coordinator_with(containerflow::orchestration::StepRegistry::new());
    let cancel = CancellationToken::new();
    let outcome = run(&coordinator, "wf_empty", steps::ANALYZE_REPOSITORY, &cancel).await;
    let report = outcome.failure().unwrap();
    assert_eq!(report.error, "no executor registered for step analyze_repository");
    assert!(report.state_persisted);
}

#[tokio::test]
async fn invalid_requests_fail_before_io() {
    let coordinator = coordinator_with(full_registry());
    let cancel = CancellationToken::new();

    for request in [
        StepRequest::new(steps::ANALYZE_REPOSITORY, "wf_v"),
        StepRequest::new(steps::BUILD_IMAGE, ""),
        StepRequest::new("made_up_step", "wf_v"),
    ] {
        let err = coordinator.execute_step(request, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{err:?}");
    }
    assert!(coordinator.manager().store().get("wf_v").await.unwrap().is_none());
}

#[tokio::test]
async fn request_from_tool_params() {
    let coordinator = coordinator_with(full_registry());
    let cancel = CancellationToken::new();
    let params = json!({
        "session_id": "wf_params",
        "repo_path": "/src/app",
        "retry_number": 1
    });
    let request = StepRequest::from_params(
        steps::ANALYZE_REPOSITORY,
        params.as_object().cloned().unwrap(),
    )
    .unwrap();
    let outcome = coordinator.execute_step(request, &cancel).await.unwrap();
    assert!(outcome.is_success());
}

#[tokio::test]
async fn cancelled_invocation_leaves_no_lock_behind() {
    let coordinator = coordinator_with(full_registry());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = coordinator
        .execute_step(StepRequest::new(steps::BUILD_IMAGE, "wf_cancel"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled { .. }));
    assert!(coordinator.manager().locks().is_empty());
}
