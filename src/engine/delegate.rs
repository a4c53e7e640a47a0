//! Build-backed step delegates.
//!
//! `DelegateFactory` captures what every step of a build shares (the build
//! sink, policy checker, artifact wirer, image fetcher) and hands out one
//! `BuildStepDelegate` per run state. Delegates turn step lifecycle calls
//! into `BuildEvent`s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, info_span, warn};

use crate::core::RunState;
use crate::domain::{
    BuildEvent, EventType, GetPlan, ImageResource, Origin, PlanId, StepMetadata, VersionResult,
    VersionedResourceTypes,
};
use crate::error::StepError;
use crate::exec::{GetDelegate, GetDelegateFactory, StepContext, TraceContext};
use crate::worker::{ArtifactWirer, ImageSpec, LogSink, OutputSink};

use super::build::{Build, SavedOutput};
use super::clock::{Clock, SystemClock};
use super::image::ImageFetcher;
use super::policy::{PolicyChecker, PolicyInput, ACTION_USE_IMAGE};

/// Builds delegates for the steps of one plan node
#[derive(Clone)]
pub struct DelegateFactory {
    build: Arc<dyn Build>,
    plan_id: PlanId,
    metadata: StepMetadata,
    policy_checker: Arc<dyn PolicyChecker>,
    artifact_wirer: ArtifactWirer,
    image_fetcher: Arc<dyn ImageFetcher>,
    clock: Arc<dyn Clock>,
    tracing_enabled: bool,
}

impl DelegateFactory {
    pub fn new(
        build: Arc<dyn Build>,
        plan_id: PlanId,
        metadata: StepMetadata,
        policy_checker: Arc<dyn PolicyChecker>,
        artifact_wirer: ArtifactWirer,
        image_fetcher: Arc<dyn ImageFetcher>,
    ) -> Self {
        Self {
            build,
            plan_id,
            metadata,
            policy_checker,
            artifact_wirer,
            image_fetcher,
            clock: Arc::new(SystemClock),
            tracing_enabled: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Propagate trace contexts to resource scripts
    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing_enabled = enabled;
        self
    }

    pub fn build_step_delegate(&self, state: &RunState) -> BuildStepDelegate {
        BuildStepDelegate {
            build: self.build.clone(),
            plan_id: self.plan_id.clone(),
            metadata: self.metadata.clone(),
            state: state.clone(),
            clock: self.clock.clone(),
            policy_checker: self.policy_checker.clone(),
            artifact_wirer: self.artifact_wirer.clone(),
            image_fetcher: self.image_fetcher.clone(),
            tracing_enabled: self.tracing_enabled,
            finished: AtomicBool::new(false),
        }
    }
}

impl GetDelegateFactory for DelegateFactory {
    fn get_delegate(&self, state: &RunState) -> Arc<dyn GetDelegate> {
        Arc::new(self.build_step_delegate(state))
    }
}

impl std::fmt::Debug for DelegateFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegateFactory")
            .field("build", &self.build.id())
            .field("plan_id", &self.plan_id)
            .field("tracing_enabled", &self.tracing_enabled)
            .finish_non_exhaustive()
    }
}

/// Delegate recording a step's lifecycle against its build
pub struct BuildStepDelegate {
    build: Arc<dyn Build>,
    plan_id: PlanId,
    metadata: StepMetadata,
    state: RunState,
    clock: Arc<dyn Clock>,
    policy_checker: Arc<dyn PolicyChecker>,
    artifact_wirer: ArtifactWirer,
    image_fetcher: Arc<dyn ImageFetcher>,
    tracing_enabled: bool,
    finished: AtomicBool,
}

impl BuildStepDelegate {
    fn event(&self, event_type: EventType, payload: impl Into<String>) -> BuildEvent {
        BuildEvent::new(
            self.build.id(),
            Some(self.plan_id.clone()),
            event_type,
            payload,
            self.clock.now(),
        )
    }

    async fn save(&self, event: BuildEvent) {
        if let Err(e) = self.build.save_event(event).await {
            warn!(error = %e, plan_id = %self.plan_id, "Failed to save build event");
        }
    }

    fn log_sink(&self, origin: Origin) -> OutputSink {
        Arc::new(BuildLogSink {
            build: self.build.clone(),
            plan_id: self.plan_id.clone(),
            origin,
            clock: self.clock.clone(),
        })
    }

    async fn check_image_policy(&self, image: &ImageResource, privileged: bool) -> Result<(), StepError> {
        if !self.policy_checker.should_check(ACTION_USE_IMAGE) {
            return Ok(());
        }

        let input = PolicyInput {
            action: ACTION_USE_IMAGE.to_string(),
            team: self.metadata.team_name.clone(),
            pipeline: self.metadata.pipeline_name.clone(),
            data: json!({
                "image_type": image.type_name,
                "image_source": image.source,
                "privileged": privileged,
            }),
        };

        let result = self.policy_checker.check(&input).await;
        if result.allowed {
            return Ok(());
        }

        Err(StepError::PolicyDenied {
            action: ACTION_USE_IMAGE.to_string(),
            reasons: result.reasons.join("; "),
        })
    }
}

#[async_trait]
impl GetDelegate for BuildStepDelegate {
    fn start_span(&self, ctx: &StepContext, component: &str) -> StepContext {
        let span = info_span!(
            parent: ctx.span(),
            "step",
            component,
            build_id = self.build.id(),
            plan_id = %self.plan_id
        );

        let trace = if self.tracing_enabled {
            Some(
                ctx.trace()
                    .map(TraceContext::child)
                    .unwrap_or_else(TraceContext::new_root),
            )
        } else {
            None
        };

        ctx.with_span(span, trace)
    }

    fn stdout(&self) -> OutputSink {
        self.log_sink(Origin::Stdout)
    }

    fn stderr(&self) -> OutputSink {
        self.log_sink(Origin::Stderr)
    }

    async fn fetch_image(
        &self,
        ctx: &StepContext,
        image: ImageResource,
        types: VersionedResourceTypes,
        privileged: bool,
    ) -> Result<ImageSpec, StepError> {
        self.check_image_policy(&image, privileged).await?;

        let name = image.name.clone();
        let fetched = self
            .image_fetcher
            .clone()
            .fetch(ctx, &self.state, image, types, privileged, self.stderr())
            .await?;
        let source = self.artifact_wirer.wire_image(&fetched.artifact).await?;

        let mut event = self.event(EventType::ImageGet, name.as_str());
        event.version = fetched.version.clone();
        self.save(event).await;

        info!(resource_type = %name, volume = %source.volume().handle, "Fetched custom type image");
        Ok(ImageSpec::Artifact { source, privileged })
    }

    async fn initializing(&self) {
        self.save(self.event(EventType::Initialize, "")).await;
    }

    async fn starting(&self) {
        self.save(self.event(EventType::Start, "")).await;
    }

    async fn selected_worker(&self, worker: &str) {
        self.save(self.event(EventType::SelectedWorker, "").with_worker(worker))
            .await;
    }

    async fn finished(&self, exit_status: i32, info: &VersionResult) {
        if self.finished.swap(true, Ordering::SeqCst) {
            warn!(plan_id = %self.plan_id, "Step already finished");
            return;
        }

        let event = self
            .event(EventType::Finish, "")
            .with_exit_status(exit_status)
            .with_version_result(info);
        self.save(event).await;

        info!(plan_id = %self.plan_id, exit_status, "Step finished");
    }

    async fn update_version(&self, plan: &GetPlan, info: &VersionResult) {
        let output = SavedOutput {
            resource: plan.resource.clone(),
            resource_type: plan.type_name.clone(),
            version_result: info.clone(),
        };

        match self.build.save_output(output).await {
            Ok(()) => debug!(resource = %plan.resource, version = ?info.version, "Saved version"),
            Err(e) => warn!(error = %e, resource = %plan.resource, "Failed to save version"),
        }
    }

    async fn errored(&self, message: &str) {
        self.save(self.event(EventType::Error, "").with_error(message))
            .await;
    }
}

/// Writes process output as log events
struct BuildLogSink {
    build: Arc<dyn Build>,
    plan_id: PlanId,
    origin: Origin,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl LogSink for BuildLogSink {
    async fn write(&self, chunk: &str) {
        let event = BuildEvent::new(
            self.build.id(),
            Some(self.plan_id.clone()),
            EventType::Log,
            chunk,
            self.clock.now(),
        )
        .with_origin(self.origin);

        if let Err(e) = self.build.save_event(event).await {
            warn!(error = %e, "Failed to save log event");
        }
    }
}
