//! Per-step delegate contract.
//!
//! A step reports everything observable about its execution through its
//! delegate: lifecycle events, process output, image fetches for custom
//! types, and the version it resolved. Delegates are built per run state by
//! a factory holding the build's shared dependencies.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::RunState;
use crate::domain::{GetPlan, ImageResource, VersionResult, VersionedResourceTypes};
use crate::error::StepError;
use crate::worker::{ImageSpec, OutputSink};

use super::StepContext;

#[async_trait]
pub trait GetDelegate: Send + Sync {
    /// Open a span for `component` below `ctx`; the returned context shares
    /// its cancellation
    fn start_span(&self, ctx: &StepContext, component: &str) -> StepContext;

    fn stdout(&self) -> OutputSink;
    fn stderr(&self) -> OutputSink;

    /// Fetch the image of a custom resource type, returning the image to
    /// create the step's container from
    async fn fetch_image(
        &self,
        ctx: &StepContext,
        image: ImageResource,
        types: VersionedResourceTypes,
        privileged: bool,
    ) -> Result<ImageSpec, StepError>;

    async fn initializing(&self);

    /// The resource script is about to run
    async fn starting(&self);

    async fn selected_worker(&self, worker: &str);

    /// The resource script exited; emitted exactly once per run
    async fn finished(&self, exit_status: i32, info: &VersionResult);

    /// Persist the fetched version against the plan's resource
    async fn update_version(&self, plan: &GetPlan, info: &VersionResult);

    async fn errored(&self, message: &str);
}

pub trait GetDelegateFactory: Send + Sync {
    fn get_delegate(&self, state: &RunState) -> Arc<dyn GetDelegate>;
}
