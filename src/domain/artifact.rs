//! Artifacts produced by steps and the per-build repository holding them.
//!
//! Artifacts are worker-local handles. Streamable artifacts are backed by a
//! volume; cache artifacts are task-cache slots whose volume is discovered
//! later by whichever worker claims them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Output of a Get step
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GetArtifact {
    pub volume_handle: String,
}

/// Output of a Task step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskArtifact {
    pub volume_handle: String,
}

/// Placeholder for a task cache; may not have a volume yet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheArtifact {
    pub team_id: i64,
    pub job_id: i64,
    pub step_name: String,
    pub path: String,
}

/// An artifact handle registered in the repository
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Artifact {
    Get(GetArtifact),
    Task(TaskArtifact),
    Cache(CacheArtifact),
}

impl Artifact {
    /// Identity used for volume lookups
    pub fn id(&self) -> String {
        match self {
            Self::Get(a) => a.volume_handle.clone(),
            Self::Task(a) => a.volume_handle.clone(),
            Self::Cache(a) => format!("{}/{}/{}/{}", a.team_id, a.job_id, a.step_name, a.path),
        }
    }

    /// Human-readable kind, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Get(_) => "get",
            Self::Task(_) => "task",
            Self::Cache(_) => "cache",
        }
    }

    pub fn is_cache(&self) -> bool {
        matches!(self, Self::Cache(_))
    }
}

impl From<GetArtifact> for Artifact {
    fn from(artifact: GetArtifact) -> Self {
        Self::Get(artifact)
    }
}

/// Name an artifact is registered under, unique within a build
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactName(pub String);

impl ArtifactName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-build mapping of artifact name to artifact.
///
/// Each name has a single producing step, so writers never contend on the
/// same key; the lock only guards the map itself.
#[derive(Debug, Default)]
pub struct ArtifactRepository {
    artifacts: RwLock<HashMap<ArtifactName, Artifact>>,
}

impl ArtifactRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an artifact, replacing any earlier artifact of the same name
    pub fn register_artifact(&self, name: ArtifactName, artifact: Artifact) -> Option<Artifact> {
        self.artifacts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, artifact)
    }

    pub fn artifact_for(&self, name: &ArtifactName) -> Option<Artifact> {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshot of all artifacts, ordered by name
    pub fn as_map(&self) -> BTreeMap<ArtifactName, Artifact> {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.artifacts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
