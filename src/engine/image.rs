//! Fetching custom resource type images.
//!
//! A custom type's image is itself fetched by a Get step, run in a child run
//! state so its artifact stays out of the build's repository. When the
//! image's own type is custom, the nested step fetches that image in turn.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info_span};

use crate::core::{ResourceCache, ResourceCacheFactory, RunState};
use crate::domain::{
    resources_dir, Artifact, ArtifactName, ContainerMetadata, ContainerType, GetPlan,
    ImageResource, PlanId, StepMetadata, Version, VersionResult, VersionedResourceTypes,
};
use crate::error::StepError;
use crate::exec::{GetDelegate, GetDelegateFactory, GetStep, Step, StepContext};
use crate::worker::{ArtifactWirer, Client, ContainerPlacementStrategy, ImageSpec, OutputSink, Pool};

/// An image ready to be wired into a container
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedImage {
    pub artifact: Artifact,
    pub version: Option<Version>,
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch `image`, writing fetch logs to `logs`
    async fn fetch(
        self: Arc<Self>,
        ctx: &StepContext,
        state: &RunState,
        image: ImageResource,
        types: VersionedResourceTypes,
        privileged: bool,
        logs: OutputSink,
    ) -> Result<FetchedImage, StepError>;
}

/// Fetches images by running nested Get steps
pub struct NestedGetImageFetcher {
    metadata: StepMetadata,
    cache_factory: Arc<dyn ResourceCacheFactory>,
    strategy: Arc<dyn ContainerPlacementStrategy>,
    client: Arc<dyn Client>,
    pool: Arc<dyn Pool>,
    artifact_wirer: ArtifactWirer,
}

impl NestedGetImageFetcher {
    pub fn new(
        metadata: StepMetadata,
        cache_factory: Arc<dyn ResourceCacheFactory>,
        strategy: Arc<dyn ContainerPlacementStrategy>,
        client: Arc<dyn Client>,
        pool: Arc<dyn Pool>,
        artifact_wirer: ArtifactWirer,
    ) -> Self {
        Self {
            metadata,
            cache_factory,
            strategy,
            client,
            pool,
            artifact_wirer,
        }
    }
}

#[async_trait]
impl ImageFetcher for NestedGetImageFetcher {
    async fn fetch(
        self: Arc<Self>,
        ctx: &StepContext,
        state: &RunState,
        image: ImageResource,
        types: VersionedResourceTypes,
        _privileged: bool,
        logs: OutputSink,
    ) -> Result<FetchedImage, StepError> {
        let plan_id = PlanId::new(format!("image-get:{}", image.name));
        let plan = GetPlan {
            name: image.name.clone(),
            type_name: image.type_name,
            source: image.source,
            params: image.params,
            version: image.version,
            resource: String::new(),
            tags: image.tags,
            resource_types: types,
        };
        let container_metadata = ContainerMetadata {
            working_directory: resources_dir("get"),
            container_type: ContainerType::Get,
            step_name: image.name.clone(),
            pipeline_id: self.metadata.pipeline_id,
        };

        let fetched_version = Arc::new(Mutex::new(None));
        let delegates = Arc::new(ImageGetDelegateFactory {
            logs,
            fetcher: self.clone(),
            artifact_wirer: self.artifact_wirer.clone(),
            fetched_version: fetched_version.clone(),
        });

        let step = GetStep::new(
            plan_id.clone(),
            plan,
            self.metadata.clone(),
            container_metadata,
            self.cache_factory.clone(),
            self.strategy.clone(),
            delegates,
            self.client.clone(),
            self.pool.clone(),
        );

        let scope = state.child();
        debug!(resource_type = %image.name, "Running nested image fetch");
        if !step.run(ctx, &scope).await? {
            return Err(StepError::ImageFetch {
                resource_type: image.name,
                message: "image fetch did not succeed".to_string(),
            });
        }

        let artifact = scope
            .artifact_repository()
            .artifact_for(&ArtifactName::new(image.name.clone()))
            .ok_or_else(|| StepError::ImageFetch {
                resource_type: image.name.clone(),
                message: "image fetch registered no artifact".to_string(),
            })?;
        let version = fetched_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .or_else(|| {
                scope
                    .result::<ResourceCache>(&plan_id)
                    .and_then(|cache| cache.version)
            });

        Ok(FetchedImage { artifact, version })
    }
}

impl std::fmt::Debug for NestedGetImageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedGetImageFetcher")
            .field("metadata", &self.metadata)
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}

struct ImageGetDelegateFactory {
    logs: OutputSink,
    fetcher: Arc<dyn ImageFetcher>,
    artifact_wirer: ArtifactWirer,
    fetched_version: Arc<Mutex<Option<Version>>>,
}

impl GetDelegateFactory for ImageGetDelegateFactory {
    fn get_delegate(&self, state: &RunState) -> Arc<dyn GetDelegate> {
        Arc::new(ImageGetDelegate {
            state: state.clone(),
            logs: self.logs.clone(),
            fetcher: self.fetcher.clone(),
            artifact_wirer: self.artifact_wirer.clone(),
            fetched_version: self.fetched_version.clone(),
        })
    }
}

/// Delegate for nested image fetches: output goes to the parent step's log,
/// lifecycle events only to tracing
struct ImageGetDelegate {
    state: RunState,
    logs: OutputSink,
    fetcher: Arc<dyn ImageFetcher>,
    artifact_wirer: ArtifactWirer,

    /// Version reported by a successful image fetch
    fetched_version: Arc<Mutex<Option<Version>>>,
}

#[async_trait]
impl GetDelegate for ImageGetDelegate {
    fn start_span(&self, ctx: &StepContext, component: &str) -> StepContext {
        let span = info_span!(parent: ctx.span(), "image_get", component);
        ctx.with_span(span, ctx.trace().map(|t| t.child()))
    }

    fn stdout(&self) -> OutputSink {
        self.logs.clone()
    }

    fn stderr(&self) -> OutputSink {
        self.logs.clone()
    }

    async fn fetch_image(
        &self,
        ctx: &StepContext,
        image: ImageResource,
        types: VersionedResourceTypes,
        privileged: bool,
    ) -> Result<ImageSpec, StepError> {
        let fetched = self
            .fetcher
            .clone()
            .fetch(ctx, &self.state, image, types, privileged, self.logs.clone())
            .await?;
        let source = self.artifact_wirer.wire_image(&fetched.artifact).await?;

        Ok(ImageSpec::Artifact { source, privileged })
    }

    async fn initializing(&self) {
        debug!("Initializing image fetch");
    }

    async fn starting(&self) {
        debug!("Starting image fetch");
    }

    async fn selected_worker(&self, worker: &str) {
        debug!(worker, "Selected worker for image fetch");
    }

    async fn finished(&self, exit_status: i32, info: &VersionResult) {
        debug!(exit_status, version = ?info.version, "Image fetch finished");
        if exit_status == 0 {
            *self
                .fetched_version
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(info.version.clone());
        }
    }

    async fn update_version(&self, _plan: &GetPlan, _info: &VersionResult) {}

    async fn errored(&self, message: &str) {
        debug!(error = message, "Image fetch errored");
    }
}
