//! Execution client contract.
//!
//! The client runs a resource script inside an already placed container and
//! reports what it produced. A script's non-zero exit is a result, not an
//! error; errors mean the script could not be run at all.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::ResourceCache;
use crate::domain::{ContainerMetadata, ContainerOwner, GetArtifact, VersionResult};
use crate::error::StepError;
use crate::exec::{GetDelegate, StepContext};
use crate::resource::Resource;

use super::{
    Container, ContainerPlacementStrategy, ContainerSpec, ProcessSpec, VolumeFinder, WorkerSpec,
};

/// Everything needed to run a Get in a placed container
#[derive(Clone)]
pub struct GetRequest {
    pub owner: ContainerOwner,
    pub container: Container,
    pub container_spec: ContainerSpec,
    pub worker_spec: WorkerSpec,
    pub strategy: Arc<dyn ContainerPlacementStrategy>,
    pub metadata: ContainerMetadata,
    pub process_spec: ProcessSpec,

    /// Receives the `starting` event once the script is about to run
    pub delegate: Arc<dyn GetDelegate>,

    pub resource_cache: ResourceCache,
    pub resource: Resource,
    pub volume_finder: Arc<dyn VolumeFinder>,
}

impl std::fmt::Debug for GetRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetRequest")
            .field("owner", &self.owner)
            .field("container", &self.container.handle)
            .field("worker_spec", &self.worker_spec)
            .field("strategy", &self.strategy.name())
            .field("process_spec", &self.process_spec)
            .field("resource_cache", &self.resource_cache.id)
            .finish_non_exhaustive()
    }
}

/// Outcome of a Get the script ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResult {
    pub exit_status: i32,
    pub version_result: VersionResult,

    /// Volume holding the fetched bits
    pub artifact: GetArtifact,
}

impl GetResult {
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

#[async_trait]
pub trait Client: Send + Sync {
    async fn run_get_step(
        &self,
        ctx: &StepContext,
        request: GetRequest,
    ) -> Result<GetResult, StepError>;
}
