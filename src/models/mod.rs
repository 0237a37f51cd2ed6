//! # Data Models
//!
//! Typed records the engine reads and writes: the store-owned [`Session`],
//! the engine's [`WorkflowState`] view of it, the closed set of step
//! [`Artifact`]s, and the deploy step's [`DeploymentFailureTracking`].

pub mod artifacts;
pub mod failure_tracking;
pub mod session;
pub mod workflow_state;

pub use artifacts::{
    AnalysisArtifact, Artifact, ArtifactKind, BuildArtifact, DockerfileArtifact,
    KubernetesArtifact, ScanArtifact, VulnerabilityCounts, WorkflowArtifacts,
};
pub use failure_tracking::{DeploymentFailureTracking, FailureRecord};
pub use session::{Session, SessionStatus};
pub use workflow_state::{WorkflowError, WorkflowMetadata, WorkflowState};
