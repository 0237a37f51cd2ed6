//! Step artifacts.
//!
//! Each pipeline step that produces something later steps need records it as
//! one variant of [`Artifact`]. [`WorkflowArtifacts`] holds at most one
//! artifact per [`ArtifactKind`] and persists as a map keyed by
//! `analyze_result`, `dockerfile_result`, `build_result`, `scan_result` and
//! `k8s_result`.

use serde::de::{Deserializer, Error as _};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Analysis,
    Dockerfile,
    Build,
    Scan,
    Kubernetes,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::Analysis,
        ArtifactKind::Dockerfile,
        ArtifactKind::Build,
        ArtifactKind::Scan,
        ArtifactKind::Kubernetes,
    ];

    /// Key under which the artifact is persisted
    pub fn storage_key(&self) -> &'static str {
        match self {
            ArtifactKind::Analysis => "analyze_result",
            ArtifactKind::Dockerfile => "dockerfile_result",
            ArtifactKind::Build => "build_result",
            ArtifactKind::Scan => "scan_result",
            ArtifactKind::Kubernetes => "k8s_result",
        }
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.storage_key() == key)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_key())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisArtifact {
    pub language: String,
    pub framework: String,
    pub port: u32,
    pub build_command: String,
    pub start_command: String,
    pub repo_path: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerfileArtifact {
    pub content: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildArtifact {
    pub image_id: String,
    pub image_ref: String,
    pub image_size: i64,
    pub build_time: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulnerabilityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub unknown: u32,
}

impl VulnerabilityCounts {
    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low + self.unknown
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanArtifact {
    pub scanner: String,
    pub status: String,
    pub vulnerabilities: VulnerabilityCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesArtifact {
    pub namespace: String,
    pub endpoint: String,
    pub manifests: Vec<String>,
}

/// Result payload attached to the workflow by a completed step
#[derive(Debug, Clone, PartialEq)]
pub enum Artifact {
    Analysis(AnalysisArtifact),
    Dockerfile(DockerfileArtifact),
    Build(BuildArtifact),
    Scan(ScanArtifact),
    Kubernetes(KubernetesArtifact),
}

impl Artifact {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Analysis(_) => ArtifactKind::Analysis,
            Artifact::Dockerfile(_) => ArtifactKind::Dockerfile,
            Artifact::Build(_) => ArtifactKind::Build,
            Artifact::Scan(_) => ArtifactKind::Scan,
            Artifact::Kubernetes(_) => ArtifactKind::Kubernetes,
        }
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            Artifact::Analysis(a) => serde_json::to_value(a),
            Artifact::Dockerfile(a) => serde_json::to_value(a),
            Artifact::Build(a) => serde_json::to_value(a),
            Artifact::Scan(a) => serde_json::to_value(a),
            Artifact::Kubernetes(a) => serde_json::to_value(a),
        }
    }

    pub fn from_value(kind: ArtifactKind, value: serde_json::Value) -> serde_json::Result<Self> {
        Ok(match kind {
            ArtifactKind::Analysis => Artifact::Analysis(serde_json::from_value(value)?),
            ArtifactKind::Dockerfile => Artifact::Dockerfile(serde_json::from_value(value)?),
            ArtifactKind::Build => Artifact::Build(serde_json::from_value(value)?),
            ArtifactKind::Scan => Artifact::Scan(serde_json::from_value(value)?),
            ArtifactKind::Kubernetes => Artifact::Kubernetes(serde_json::from_value(value)?),
        })
    }
}

/// At most one artifact per kind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowArtifacts {
    entries: BTreeMap<ArtifactKind, Artifact>,
}

impl WorkflowArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the artifact of the same kind
    pub fn insert(&mut self, artifact: Artifact) {
        self.entries.insert(artifact.kind(), artifact);
    }

    pub fn get(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.entries.get(&kind)
    }

    pub fn contains(&self, kind: ArtifactKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ArtifactKind> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every artifact present in `other`; kinds absent from `other` are kept
    pub fn merge(&mut self, other: WorkflowArtifacts) {
        self.entries.extend(other.entries);
    }

    pub fn analysis(&self) -> Option<&AnalysisArtifact> {
        match self.get(ArtifactKind::Analysis) {
            Some(Artifact::Analysis(a)) => Some(a),
            _ => None,
        }
    }

    pub fn dockerfile(&self) -> Option<&DockerfileArtifact> {
        match self.get(ArtifactKind::Dockerfile) {
            Some(Artifact::Dockerfile(a)) => Some(a),
            _ => None,
        }
    }

    pub fn build(&self) -> Option<&BuildArtifact> {
        match self.get(ArtifactKind::Build) {
            Some(Artifact::Build(a)) => Some(a),
            _ => None,
        }
    }

    pub fn scan(&self) -> Option<&ScanArtifact> {
        match self.get(ArtifactKind::Scan) {
            Some(Artifact::Scan(a)) => Some(a),
            _ => None,
        }
    }

    pub fn kubernetes(&self) -> Option<&KubernetesArtifact> {
        match self.get(ArtifactKind::Kubernetes) {
            Some(Artifact::Kubernetes(a)) => Some(a),
            _ => None,
        }
    }
}

impl Serialize for WorkflowArtifacts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (kind, artifact) in &self.entries {
            match artifact {
                Artifact::Analysis(a) => map.serialize_entry(kind.storage_key(), a)?,
                Artifact::Dockerfile(a) => map.serialize_entry(kind.storage_key(), a)?,
                Artifact::Build(a) => map.serialize_entry(kind.storage_key(), a)?,
                Artifact::Scan(a) => map.serialize_entry(kind.storage_key(), a)?,
                Artifact::Kubernetes(a) => map.serialize_entry(kind.storage_key(), a)?,
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for WorkflowArtifacts {
    /// Unknown keys and malformed entries are dropped so one bad artifact does
    /// not discard the rest of the workflow state
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        let map = match raw {
            None | Some(serde_json::Value::Null) => return Ok(Self::default()),
            Some(serde_json::Value::Object(map)) => map,
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "artifacts must be an object, found {other}"
                )))
            }
        };

        let mut artifacts = Self::default();
        for (key, value) in map {
            let Some(kind) = ArtifactKind::from_storage_key(&key) else {
                warn!(key = %key, "Ignoring unknown artifact key");
                continue;
            };
            if value.is_null() {
                continue;
            }
            match Artifact::from_value(kind, value) {
                Ok(artifact) => artifacts.insert(artifact),
                Err(e) => warn!(key = %key, error = %e, "Dropping malformed artifact"),
            }
        }
        Ok(artifacts)
    }
}
