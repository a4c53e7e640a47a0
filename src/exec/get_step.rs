//! Get step: fetch one version of a resource into a volume.
//!
//! Flow:
//! 1. Resolve the base type at the bottom of the custom type chain
//! 2. For a custom type, fetch its image through the delegate
//! 3. Resolve the resource cache for the interpolated configuration
//! 4. Place a container and run `/opt/resource/in` through the client
//! 5. Release the container, then register the fetched volume under the
//!    plan's name and store the cache

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn, Instrument};

use crate::core::vars::{interpolate_map, interpolate_str, interpolate_type_sources};
use crate::core::{ResourceCache, ResourceCacheFactory, RunState};
use crate::domain::{
    resources_dir, Artifact, ArtifactName, ContainerMetadata, ContainerOwner, GetPlan, PlanId,
    StepMetadata,
};
use crate::error::StepError;
use crate::resource::Resource;
use crate::worker::{
    Client, ContainerPlacementStrategy, ContainerSpec, GetRequest, GetResult, ImageSpec, Pool,
    ProcessSpec, WorkerSpec, RESOURCE_IN_PATH,
};

use super::{GetDelegate, GetDelegateFactory, Step, StepContext};

pub struct GetStep {
    plan_id: PlanId,
    plan: GetPlan,
    metadata: StepMetadata,
    container_metadata: ContainerMetadata,
    cache_factory: Arc<dyn ResourceCacheFactory>,
    strategy: Arc<dyn ContainerPlacementStrategy>,
    delegate_factory: Arc<dyn GetDelegateFactory>,
    client: Arc<dyn Client>,
    pool: Arc<dyn Pool>,
}

impl GetStep {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plan_id: PlanId,
        plan: GetPlan,
        metadata: StepMetadata,
        container_metadata: ContainerMetadata,
        cache_factory: Arc<dyn ResourceCacheFactory>,
        strategy: Arc<dyn ContainerPlacementStrategy>,
        delegate_factory: Arc<dyn GetDelegateFactory>,
        client: Arc<dyn Client>,
        pool: Arc<dyn Pool>,
    ) -> Self {
        Self {
            plan_id,
            plan,
            metadata,
            container_metadata,
            cache_factory,
            strategy,
            delegate_factory,
            client,
            pool,
        }
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    pub fn plan(&self) -> &GetPlan {
        &self.plan
    }

    async fn fetch(
        &self,
        ctx: &StepContext,
        state: &RunState,
        delegate: &Arc<dyn GetDelegate>,
    ) -> Result<bool, StepError> {
        delegate.initializing().await;

        let vars = state.variables();
        let source = interpolate_map(&self.plan.source, vars)?;
        let params = interpolate_map(&self.plan.params, vars)?;
        let types = interpolate_type_sources(&self.plan.resource_types, vars)?;

        let type_name = interpolate_str(&self.plan.type_name, vars)?;
        let base_type = self.plan.resource_types.base_type(&type_name)?;
        let custom = self.plan.resource_types.lookup(&type_name);

        // A custom type's own tags replace the plan's
        let tags = match custom {
            Some(custom) if !custom.tags.is_empty() => custom.tags.clone(),
            _ => self.plan.tags.clone(),
        };

        let image_spec = match custom {
            Some(custom) => {
                let mut image = custom.image_resource();
                image.tags = tags.clone();

                debug!(resource_type = %custom.name, tags = ?image.tags, "Fetching custom type image");
                delegate
                    .fetch_image(
                        ctx,
                        image,
                        self.plan.resource_types.without(&custom.name),
                        custom.privileged,
                    )
                    .await?
            }
            None => ImageSpec::ResourceType(type_name.clone()),
        };

        let cache = self
            .cache_factory
            .find_or_create(
                &type_name,
                self.plan.version.as_ref(),
                &source,
                &params,
                &types,
            )
            .await?;

        let mut env = self.metadata.env();
        if let Some(trace) = ctx.trace() {
            env.push(trace.env());
        }

        let container_spec = ContainerSpec::new(image_spec, self.metadata.team_id, env);
        let worker_spec = WorkerSpec {
            resource_type: base_type,
            team_id: self.metadata.team_id,
            tags,
        };
        let owner = ContainerOwner::build_step(
            self.metadata.build_id,
            self.plan_id.clone(),
            self.metadata.team_id,
        );

        let container = self
            .pool
            .select_container(
                ctx,
                &owner,
                self.strategy.as_ref(),
                &container_spec,
                &worker_spec,
                &self.container_metadata,
            )
            .await?;
        delegate.selected_worker(&container.worker_name).await;

        let process_spec = ProcessSpec {
            path: RESOURCE_IN_PATH.to_string(),
            args: vec![resources_dir("get")],
            stdout: delegate.stdout(),
            stderr: delegate.stderr(),
        };

        let resource = Resource::new(source, params, self.plan.version.clone())
            .bound_to(container.handle.clone());

        let placed = container.clone();
        let request = GetRequest {
            owner,
            container,
            container_spec,
            worker_spec,
            strategy: self.strategy.clone(),
            metadata: self.container_metadata.clone(),
            process_spec,
            delegate: delegate.clone(),
            resource_cache: cache.clone(),
            resource,
            volume_finder: self.pool.clone().volume_finder(),
        };

        let result = tokio::select! {
            result = self.client.run_get_step(ctx, request) => result,
            _ = ctx.cancelled() => {
                warn!("Get step interrupted");
                Err(StepError::Interrupted)
            }
        };
        self.pool.release_container(&placed).await;

        self.record(state, delegate, cache, result?).await
    }

    async fn record(
        &self,
        state: &RunState,
        delegate: &Arc<dyn GetDelegate>,
        cache: ResourceCache,
        result: GetResult,
    ) -> Result<bool, StepError> {
        if !result.succeeded() {
            info!(exit_status = result.exit_status, "Get failed");
            delegate
                .finished(result.exit_status, &result.version_result)
                .await;
            return Ok(false);
        }

        state.artifact_repository().register_artifact(
            ArtifactName::new(self.plan.name.clone()),
            Artifact::Get(result.artifact.clone()),
        );
        state.store_result(self.plan_id.clone(), cache);

        delegate
            .finished(result.exit_status, &result.version_result)
            .await;

        if !self.plan.is_anonymous() {
            delegate
                .update_version(&self.plan, &result.version_result)
                .await;
        }

        info!(
            artifact = %result.artifact.volume_handle,
            version = ?result.version_result.version,
            "Get succeeded"
        );
        Ok(true)
    }
}

#[async_trait]
impl Step for GetStep {
    async fn run(&self, ctx: &StepContext, state: &RunState) -> Result<bool, StepError> {
        let delegate = self.delegate_factory.get_delegate(state);
        let ctx = delegate.start_span(ctx, "get");
        let span = ctx.span().clone();

        let outcome = self
            .fetch(&ctx, state, &delegate)
            .instrument(tracing::info_span!(
                parent: &span,
                "get_step",
                plan_id = %self.plan_id,
                name = %self.plan.name,
                resource_type = %self.plan.type_name
            ))
            .await;

        if let Err(e) = &outcome {
            delegate.errored(&e.to_string()).await;
        }
        outcome
    }
}

impl std::fmt::Debug for GetStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetStep")
            .field("plan_id", &self.plan_id)
            .field("plan", &self.plan.name)
            .field("strategy", &self.strategy.name())
            .finish_non_exhaustive()
    }
}
