//! # Step Sequence Registry
//!
//! The fixed, totally ordered list of pipeline steps. "Next" is defined only
//! as the following entry in this list; a name that is not in the list has no
//! position and no next step.

use crate::constants::steps;
use crate::models::ArtifactKind;
use std::collections::HashMap;

/// Artifact a step needs, and the step that produces it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prerequisite {
    pub artifact: ArtifactKind,
    pub producer: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDefinition {
    pub name: &'static str,
    /// Display label used in progress reports
    pub label: &'static str,
    pub requires: &'static [Prerequisite],
    pub produces: Option<ArtifactKind>,
}

const NEEDS_ANALYSIS: Prerequisite = Prerequisite {
    artifact: ArtifactKind::Analysis,
    producer: steps::ANALYZE_REPOSITORY,
};
const NEEDS_DOCKERFILE: Prerequisite = Prerequisite {
    artifact: ArtifactKind::Dockerfile,
    producer: steps::GENERATE_DOCKERFILE,
};
const NEEDS_BUILD: Prerequisite = Prerequisite {
    artifact: ArtifactKind::Build,
    producer: steps::BUILD_IMAGE,
};

pub static WORKFLOW_SEQUENCE: [StepDefinition; 10] = [
    StepDefinition {
        name: steps::ANALYZE_REPOSITORY,
        label: "Repository Analysis",
        requires: &[],
        produces: Some(ArtifactKind::Analysis),
    },
    StepDefinition {
        name: steps::GENERATE_DOCKERFILE,
        label: "Dockerfile Generated",
        requires: &[NEEDS_ANALYSIS],
        produces: Some(ArtifactKind::Dockerfile),
    },
    StepDefinition {
        name: steps::BUILD_IMAGE,
        label: "Build Result",
        requires: &[NEEDS_DOCKERFILE],
        produces: Some(ArtifactKind::Build),
    },
    StepDefinition {
        name: steps::SCAN_IMAGE,
        label: "Security Scan",
        requires: &[NEEDS_BUILD],
        produces: Some(ArtifactKind::Scan),
    },
    StepDefinition {
        name: steps::TAG_IMAGE,
        label: "Image Tagged",
        requires: &[NEEDS_BUILD],
        produces: None,
    },
    StepDefinition {
        name: steps::PUSH_IMAGE,
        label: "Image Pushed",
        requires: &[NEEDS_BUILD],
        produces: None,
    },
    StepDefinition {
        name: steps::GENERATE_K8S_MANIFESTS,
        label: "Manifests Generated",
        requires: &[NEEDS_BUILD, NEEDS_ANALYSIS],
        produces: Some(ArtifactKind::Kubernetes),
    },
    StepDefinition {
        name: steps::PREPARE_CLUSTER,
        label: "Cluster Ready",
        requires: &[],
        produces: None,
    },
    StepDefinition {
        name: steps::DEPLOY_APPLICATION,
        label: "Deployment",
        requires: &[Prerequisite {
            artifact: ArtifactKind::Kubernetes,
            producer: steps::GENERATE_K8S_MANIFESTS,
        }],
        produces: None,
    },
    StepDefinition {
        name: steps::VERIFY_DEPLOYMENT,
        label: "Verification",
        // manifests are written before deploy, but verification only makes sense after it
        requires: &[Prerequisite {
            artifact: ArtifactKind::Kubernetes,
            producer: steps::DEPLOY_APPLICATION,
        }],
        produces: None,
    },
];

#[derive(Debug, Clone)]
pub struct StepSequence {
    steps: &'static [StepDefinition],
    positions: HashMap<&'static str, usize>,
}

impl Default for StepSequence {
    fn default() -> Self {
        Self::canonical()
    }
}

impl StepSequence {
    /// The containerization pipeline
    pub fn canonical() -> Self {
        let positions = WORKFLOW_SEQUENCE
            .iter()
            .enumerate()
            .map(|(i, step)| (step.name, i))
            .collect();
        Self {
            steps: &WORKFLOW_SEQUENCE,
            positions,
        }
    }

    /// Zero-based position of `step`, `None` when unknown
    pub fn index(&self, step: &str) -> Option<usize> {
        self.positions.get(step).copied()
    }

    pub fn contains(&self, step: &str) -> bool {
        self.positions.contains_key(step)
    }

    /// Step after `step`; `None` for the last step and for unknown names
    pub fn next(&self, step: &str) -> Option<&'static str> {
        let index = self.index(step)?;
        self.steps.get(index + 1).map(|s| s.name)
    }

    /// First step after `step` that is not in `skip_steps`
    pub fn next_pending<S: AsRef<str>>(&self, step: &str, skip_steps: &[S]) -> Option<&'static str> {
        let index = self.index(step)?;
        self.steps[index + 1..]
            .iter()
            .map(|s| s.name)
            .find(|name| !skip_steps.iter().any(|skip| skip.as_ref() == *name))
    }

    pub fn first(&self) -> &'static str {
        self.steps[0].name
    }

    pub fn is_last(&self, step: &str) -> bool {
        self.index(step) == Some(self.steps.len() - 1)
    }

    /// Step names in pipeline order
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.steps.iter().map(|s| s.name)
    }

    pub fn definitions(&self) -> &'static [StepDefinition] {
        self.steps
    }

    pub fn definition(&self, step: &str) -> Option<&'static StepDefinition> {
        self.index(step).map(|i| &self.steps[i])
    }

    pub fn label(&self, step: &str) -> Option<&'static str> {
        self.definition(step).map(|d| d.label)
    }

    /// One-based position and total, for "step 3 of 10" style reporting
    pub fn progress(&self, step: &str) -> Option<(usize, usize)> {
        self.index(step).map(|i| (i + 1, self.steps.len()))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order() {
        let sequence = StepSequence::canonical();
        let names: Vec<_> = sequence.names().collect();
        assert_eq!(
            names,
            vec![
                "analyze_repository",
                "generate_dockerfile",
                "build_image",
                "scan_image",
                "tag_image",
                "push_image",
                "generate_k8s_manifests",
                "prepare_cluster",
                "deploy_application",
                "verify_deployment",
            ]
        );
    }

    #[test]
    fn test_next_for_every_step() {
        let sequence = StepSequence::canonical();
        let names: Vec<_> = sequence.names().collect();
        for pair in names.windows(2) {
            assert_eq!(sequence.next(pair[0]), Some(pair[1]));
        }
        assert_eq!(sequence.next(steps::VERIFY_DEPLOYMENT), None);
        assert_eq!(sequence.next("made_up_step"), None);
    }

    #[test]
    fn test_index_of_unknown_step() {
        let sequence = StepSequence::canonical();
        assert_eq!(sequence.index(steps::ANALYZE_REPOSITORY), Some(0));
        assert_eq!(sequence.index("made_up_step"), None);
    }

    #[test]
    fn test_next_pending_honours_skips() {
        let sequence = StepSequence::canonical();
        let skips = vec![steps::SCAN_IMAGE.to_string(), steps::TAG_IMAGE.to_string()];
        assert_eq!(
            sequence.next_pending(steps::BUILD_IMAGE, &skips),
            Some(steps::PUSH_IMAGE)
        );
        let skip_rest = vec![steps::VERIFY_DEPLOYMENT];
        assert_eq!(sequence.next_pending(steps::DEPLOY_APPLICATION, &skip_rest), None);
    }

    #[test]
    fn test_progress_and_labels() {
        let sequence = StepSequence::canonical();
        assert_eq!(sequence.progress(steps::BUILD_IMAGE), Some((3, 10)));
        assert_eq!(sequence.label(steps::SCAN_IMAGE), Some("Security Scan"));
        assert!(sequence.is_last(steps::VERIFY_DEPLOYMENT));
    }

    #[test]
    fn test_prerequisites() {
        let sequence = StepSequence::canonical();
        let manifests = sequence.definition(steps::GENERATE_K8S_MANIFESTS).unwrap();
        let producers: Vec<_> = manifests.requires.iter().map(|p| p.producer).collect();
        assert_eq!(producers, vec![steps::BUILD_IMAGE, steps::ANALYZE_REPOSITORY]);
        assert!(sequence
            .definition(steps::ANALYZE_REPOSITORY)
            .unwrap()
            .requires
            .is_empty());
    }
}
