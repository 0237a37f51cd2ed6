//! Step executors with scripted behaviour.

use async_trait::async_trait;
use containerflow::constants::steps;
use containerflow::models::{
    AnalysisArtifact, Artifact, BuildArtifact, DockerfileArtifact, KubernetesArtifact,
    ScanArtifact, VulnerabilityCounts, WorkflowState,
};
use containerflow::orchestration::{StepContext, StepFailure, StepOutput, StepRegistry, WorkflowStep};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Fails with each queued message in turn, then succeeds
#[derive(Debug)]
pub struct ScriptedStep {
    name: &'static str,
    failures: Mutex<VecDeque<String>>,
    artifact: Option<Artifact>,
    calls: AtomicU32,
}

impl ScriptedStep {
    pub fn succeeding(name: &'static str) -> Self {
        Self {
            name,
            failures: Mutex::new(VecDeque::new()),
            artifact: sample_artifact(name),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(name: &'static str, messages: &[&str]) -> Self {
        let step = Self::succeeding(name);
        step.failures
            .lock()
            .extend(messages.iter().map(|m| m.to_string()));
        step
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowStep for ScriptedStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(
        &self,
        context: &StepContext,
        state: &mut WorkflowState,
    ) -> Result<StepOutput, StepFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failures.lock().pop_front() {
            return Err(StepFailure::new(message)
                .with_data("attempt", serde_json::json!(context.attempt)));
        }
        if let Some(artifact) = &self.artifact {
            state.set_artifact(artifact.clone());
        }
        Ok(StepOutput::with_message(format!("{} done", self.name)))
    }
}

/// A succeeding executor for every step in the pipeline
pub fn full_registry() -> StepRegistry {
    all_steps()
        .into_iter()
        .fold(StepRegistry::new(), |registry, name| {
            registry.with(Arc::new(ScriptedStep::succeeding(name)))
        })
}

/// Registry where `step` is replaced by `executor`
pub fn registry_with(executor: Arc<ScriptedStep>) -> StepRegistry {
    let mut registry = full_registry();
    registry.register(executor);
    registry
}

pub fn all_steps() -> Vec<&'static str> {
    vec![
        steps::ANALYZE_REPOSITORY,
        steps::GENERATE_DOCKERFILE,
        steps::BUILD_IMAGE,
        steps::SCAN_IMAGE,
        steps::TAG_IMAGE,
        steps::PUSH_IMAGE,
        steps::GENERATE_K8S_MANIFESTS,
        steps::PREPARE_CLUSTER,
        steps::DEPLOY_APPLICATION,
        steps::VERIFY_DEPLOYMENT,
    ]
}

pub fn sample_artifact(step: &str) -> Option<Artifact> {
    match step {
        steps::ANALYZE_REPOSITORY => Some(Artifact::Analysis(analysis_artifact())),
        steps::GENERATE_DOCKERFILE => Some(Artifact::Dockerfile(DockerfileArtifact {
            content: "FROM python:3.12-slim\nCOPY . /app\nCMD [\"python\", \"app.py\"]\n"
                .to_string(),
            path: "/src/app/Dockerfile".to_string(),
        })),
        steps::BUILD_IMAGE => Some(Artifact::Build(build_artifact())),
        steps::SCAN_IMAGE => Some(Artifact::Scan(ScanArtifact {
            scanner: "trivy".to_string(),
            status: "passed".to_string(),
            vulnerabilities: VulnerabilityCounts {
                medium: 2,
                low: 5,
                ..Default::default()
            },
        })),
        steps::GENERATE_K8S_MANIFESTS => Some(Artifact::Kubernetes(kubernetes_artifact())),
        _ => None,
    }
}

pub fn analysis_artifact() -> AnalysisArtifact {
    let mut metadata = serde_json::Map::new();
    metadata.insert("entrypoint".to_string(), serde_json::json!("app.py"));
    AnalysisArtifact {
        language: "python".to_string(),
        framework: "flask".to_string(),
        port: 5000,
        build_command: "pip install -r requirements.txt".to_string(),
        start_command: "python app.py".to_string(),
        repo_path: "/src/app".to_string(),
        metadata,
    }
}

pub fn build_artifact() -> BuildArtifact {
    BuildArtifact {
        image_id: "sha256:4f2a9c".to_string(),
        image_ref: "registry.local/app:1.0.0".to_string(),
        image_size: 128 * 1024 * 1024,
        build_time: "2026-10-19T10:00:00Z".to_string(),
    }
}

pub fn kubernetes_artifact() -> KubernetesArtifact {
    KubernetesArtifact {
        namespace: "apps".to_string(),
        endpoint: "http://app.apps.svc.cluster.local:5000".to_string(),
        manifests: vec!["deployment.yaml".to_string(), "service.yaml".to_string()],
    }
}
