//! Workers, containers and volumes.
//!
//! This module contains:
//! - Specs: what a container needs and which workers may host it
//! - Pool: in-memory worker registry with container placement
//! - Placement: pluggable strategies choosing among eligible workers
//! - Wirer: turns artifacts into mountable (and streamable) inputs
//! - Client: runs a resource script in a placed container

pub mod client;
pub mod local;
pub mod placement;
pub mod pool;
pub mod process;
pub mod wirer;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ContainerMetadata, ContainerOwner, Tags, VersionResult};
use crate::error::{PlacementError, WireError};
use crate::exec::StepContext;

// Re-export commonly used types
pub use client::{Client, GetRequest, GetResult};
pub use local::LocalClient;
pub use placement::{
    ContainerPlacementStrategy, FewestContainersStrategy, VolumeLocalityStrategy, WorkerCandidate,
};
pub use pool::WorkerPool;
pub use process::{BufferSink, LogSink, OutputSink, ProcessSpec, RESOURCE_IN_PATH};
pub use wirer::{
    ArtifactSource, ArtifactWirer, CacheArtifactSource, Compression, InputSource,
    StreamableArtifactSource, StreamingConfig, VolumeStreamer,
};

/// Image a container is created from
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSpec {
    /// Image of a base resource type shipped with the worker
    ResourceType(String),

    /// Image produced by an earlier fetch, e.g. a custom type's image
    Artifact {
        source: StreamableArtifactSource,
        privileged: bool,
    },
}

impl ImageSpec {
    pub fn privileged(&self) -> bool {
        match self {
            Self::ResourceType(_) => false,
            Self::Artifact { privileged, .. } => *privileged,
        }
    }
}

/// What a step's container needs
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image_spec: ImageSpec,
    pub team_id: i64,
    pub env: Vec<String>,
    pub inputs: Vec<InputSource>,
}

impl ContainerSpec {
    pub fn new(image_spec: ImageSpec, team_id: i64, env: Vec<String>) -> Self {
        Self {
            image_spec,
            team_id,
            env,
            inputs: Vec::new(),
        }
    }
}

/// Which workers may host a step's container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Base resource type the worker must provide
    pub resource_type: String,
    pub team_id: i64,
    #[serde(default)]
    pub tags: Tags,
}

/// A registered worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub name: String,

    /// Base resource types this worker ships images for
    #[serde(default)]
    pub resource_types: Vec<String>,

    #[serde(default)]
    pub tags: Tags,

    /// Team owning the worker; `None` for workers shared by all teams
    #[serde(default)]
    pub team_id: Option<i64>,
}

impl WorkerInfo {
    /// Whether this worker may host a container for `spec`.
    ///
    /// Untagged steps only run on untagged workers; tagged steps need every
    /// tag. Team workers only take their own team's steps.
    pub fn satisfies(&self, spec: &WorkerSpec) -> bool {
        if !spec.resource_type.is_empty() && !self.resource_types.contains(&spec.resource_type) {
            return false;
        }

        let tags_ok = if spec.tags.is_empty() {
            self.tags.is_empty()
        } else {
            spec.tags.iter().all(|t| self.tags.contains(t))
        };
        if !tags_ok {
            return false;
        }

        match self.team_id {
            Some(team) => team == spec.team_id,
            None => true,
        }
    }
}

/// A volume on some worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub handle: String,
    pub worker_name: String,

    /// Owning team; 0 for volumes shared across teams (resource caches, images)
    pub team_id: i64,

    /// Location on the worker's filesystem
    pub path: PathBuf,

    /// Set once the volume holds a complete fetch of this resource cache
    #[serde(default)]
    pub resource_cache_id: Option<u64>,

    #[serde(default)]
    pub version_result: Option<VersionResult>,
}

impl Volume {
    pub fn visible_to(&self, team_id: i64) -> bool {
        team_id == 0 || self.team_id == 0 || self.team_id == team_id
    }
}

/// A container placed on a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub handle: String,
    pub worker_name: String,
    pub owner: ContainerOwner,
    pub metadata: ContainerMetadata,
}

/// Looks up volumes across the worker pool
#[async_trait]
pub trait VolumeFinder: Send + Sync {
    async fn find_volume(&self, team_id: i64, handle: &str) -> Result<Option<Volume>, WireError>;
}

/// Selects (or reuses) containers on eligible workers
#[async_trait]
pub trait Pool: VolumeFinder {
    async fn select_container(
        &self,
        ctx: &StepContext,
        owner: &ContainerOwner,
        strategy: &dyn ContainerPlacementStrategy,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        metadata: &ContainerMetadata,
    ) -> Result<Container, PlacementError>;

    /// Give back a container once its step no longer needs it
    async fn release_container(&self, container: &Container);

    /// This pool as a plain volume finder
    fn volume_finder(self: Arc<Self>) -> Arc<dyn VolumeFinder>;
}
