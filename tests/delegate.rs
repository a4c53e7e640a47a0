//! Build Step Delegate Integration Tests
//!
//! Lifecycle events, image policy, image fetching, and saved versions
//! recorded against an in-memory build.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use buildstep::core::{RunState, StaticVariables};
use buildstep::domain::{
    Artifact, EventType, GetArtifact, GetPlan, ImageResource, MetadataField, Origin, PlanId,
    StepMetadata, Version, VersionResult, VersionedResourceTypes,
};
use buildstep::engine::{
    Clock, DelegateFactory, FetchedImage, ImageFetcher, InMemoryBuild, PolicyChecker, PolicyInput,
    PolicyResult, ACTION_USE_IMAGE,
};
use buildstep::error::StepError;
use buildstep::exec::{GetDelegate, GetDelegateFactory, StepContext};
use buildstep::worker::{
    ArtifactWirer, Compression, ImageSpec, LogSink, OutputSink, StreamingConfig, WorkerInfo, WorkerPool,
};

// ============================================================================
// Fakes
// ============================================================================

struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Default)]
struct RecordingPolicyChecker {
    deny: Option<Vec<String>>,
    inputs: Mutex<Vec<PolicyInput>>,
}

#[async_trait]
impl PolicyChecker for RecordingPolicyChecker {
    fn should_check(&self, action: &str) -> bool {
        action == ACTION_USE_IMAGE
    }

    async fn check(&self, input: &PolicyInput) -> PolicyResult {
        self.inputs.lock().unwrap().push(input.clone());
        match &self.deny {
            Some(reasons) => PolicyResult::deny(reasons.clone()),
            None => PolicyResult::allow(),
        }
    }
}

struct FakeImageFetcher {
    handle: String,
    calls: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl ImageFetcher for FakeImageFetcher {
    async fn fetch(
        self: Arc<Self>,
        _ctx: &StepContext,
        _state: &RunState,
        image: ImageResource,
        _types: VersionedResourceTypes,
        privileged: bool,
        logs: OutputSink,
    ) -> Result<FetchedImage, StepError> {
        self.calls.lock().unwrap().push((image.name.clone(), privileged));
        logs.write("fetching image\n").await;

        Ok(FetchedImage {
            artifact: Artifact::Get(GetArtifact {
                volume_handle: self.handle.clone(),
            }),
            version: Some(version("image-digest")),
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

fn version(value: &str) -> Version {
    [("ref".to_string(), value.to_string())].into_iter().collect()
}

fn timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn metadata() -> StepMetadata {
    StepMetadata {
        team_id: 123,
        team_name: "some-team".to_string(),
        build_id: 42,
        build_name: "1".to_string(),
        pipeline_name: "some-pipeline".to_string(),
        ..Default::default()
    }
}

fn image() -> ImageResource {
    ImageResource {
        name: "custom-resource".to_string(),
        type_name: "registry-image".to_string(),
        source: [("repository".to_string(), json!("some/image"))]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

struct Harness {
    build: Arc<InMemoryBuild>,
    policy: Arc<RecordingPolicyChecker>,
    fetcher: Arc<FakeImageFetcher>,
    image_volume: String,
    factory: DelegateFactory,
}

fn harness(policy: RecordingPolicyChecker) -> Harness {
    let pool = Arc::new(WorkerPool::new());
    pool.register_worker(WorkerInfo {
        name: "some-worker".to_string(),
        resource_types: vec!["registry-image".to_string()],
        ..Default::default()
    });
    let image_volume = pool
        .create_volume("some-worker", 0, PathBuf::from("/volumes/image"))
        .unwrap();

    let build = Arc::new(InMemoryBuild::new(42));
    let policy = Arc::new(policy);
    let fetcher = Arc::new(FakeImageFetcher {
        handle: image_volume.handle.clone(),
        calls: Mutex::new(Vec::new()),
    });
    let wirer = ArtifactWirer::new(Compression::Gzip, pool, StreamingConfig::default());

    let factory = DelegateFactory::new(
        build.clone(),
        PlanId::new("56"),
        metadata(),
        policy.clone(),
        wirer,
        fetcher.clone(),
    )
    .with_clock(Arc::new(FixedClock(timestamp())));

    Harness {
        build,
        policy,
        fetcher,
        image_volume: image_volume.handle,
        factory,
    }
}

fn state() -> RunState {
    RunState::new(Arc::new(StaticVariables::new()))
}

fn event_types(build: &InMemoryBuild) -> Vec<EventType> {
    build.events().iter().map(|e| e.event_type).collect()
}

// ============================================================================
// Lifecycle events
// ============================================================================

#[tokio::test]
async fn test_lifecycle_events() {
    let h = harness(RecordingPolicyChecker::default());
    let delegate = h.factory.get_delegate(&state());

    let result = VersionResult {
        version: version("abc"),
        metadata: vec![MetadataField::new("author", "someone")],
    };

    delegate.initializing().await;
    delegate.selected_worker("some-worker").await;
    delegate.starting().await;
    delegate.finished(0, &result).await;

    assert_eq!(
        event_types(&h.build),
        vec![
            EventType::Initialize,
            EventType::SelectedWorker,
            EventType::Start,
            EventType::Finish,
        ]
    );

    let events = h.build.events();
    assert!(events.iter().all(|e| e.build_id == 42));
    assert!(events.iter().all(|e| e.plan_id == Some(PlanId::new("56"))));
    assert!(events.iter().all(|e| e.timestamp == timestamp()));
    assert_eq!(events[1].worker, Some("some-worker".to_string()));

    let finish = &events[3];
    assert_eq!(finish.exit_status, Some(0));
    assert_eq!(finish.version, Some(version("abc")));
    assert_eq!(finish.metadata, result.metadata);
}

#[tokio::test]
async fn test_finished_is_recorded_once() {
    let h = harness(RecordingPolicyChecker::default());
    let delegate = h.factory.get_delegate(&state());

    delegate.finished(1, &VersionResult::default()).await;
    delegate.finished(0, &VersionResult::default()).await;

    let finishes: Vec<_> = h
        .build
        .events()
        .into_iter()
        .filter(|e| e.event_type == EventType::Finish)
        .collect();
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].exit_status, Some(1));
}

#[tokio::test]
async fn test_errored_records_message() {
    let h = harness(RecordingPolicyChecker::default());
    let delegate = h.factory.get_delegate(&state());

    delegate.errored("nope").await;

    let events = h.build.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Error);
    assert_eq!(events[0].error, Some("nope".to_string()));
}

#[tokio::test]
async fn test_output_sinks_write_log_events() {
    let h = harness(RecordingPolicyChecker::default());
    let delegate = h.factory.get_delegate(&state());

    delegate.stdout().write("out\n").await;
    delegate.stderr().write("err\n").await;

    let events = h.build.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.event_type == EventType::Log));
    assert_eq!(events[0].payload, "out\n");
    assert_eq!(events[0].origin, Some(Origin::Stdout));
    assert_eq!(events[1].payload, "err\n");
    assert_eq!(events[1].origin, Some(Origin::Stderr));
}

#[tokio::test]
async fn test_update_version_saves_output() {
    let h = harness(RecordingPolicyChecker::default());
    let delegate = h.factory.get_delegate(&state());

    let plan = GetPlan {
        name: "some-input".to_string(),
        type_name: "git".to_string(),
        resource: "some-resource".to_string(),
        ..Default::default()
    };
    let result = VersionResult {
        version: version("abc"),
        metadata: vec![],
    };

    delegate.update_version(&plan, &result).await;

    let outputs = h.build.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].resource, "some-resource");
    assert_eq!(outputs[0].resource_type, "git");
    assert_eq!(outputs[0].version_result, result);
}

// ============================================================================
// Tracing
// ============================================================================

#[tokio::test]
async fn test_span_without_tracing_has_no_trace_context() {
    let h = harness(RecordingPolicyChecker::default());
    let delegate = h.factory.get_delegate(&state());

    let ctx = delegate.start_span(&StepContext::new(), "get");

    assert!(ctx.trace().is_none());
}

#[tokio::test]
async fn test_span_continues_parent_trace() {
    let h = harness(RecordingPolicyChecker::default());
    let factory = h.factory.clone().with_tracing(true);
    let delegate = factory.get_delegate(&state());

    let root = delegate.start_span(&StepContext::new(), "get");
    let root_trace = root.trace().cloned().unwrap();

    let nested = delegate.start_span(&root, "get");
    let nested_trace = nested.trace().cloned().unwrap();

    assert_eq!(nested_trace.trace_id, root_trace.trace_id);
    assert_ne!(nested_trace.span_id, root_trace.span_id);
    assert!(nested_trace.env().starts_with("TRACEPARENT=00-"));
}

#[tokio::test]
async fn test_span_keeps_cancellation() {
    let h = harness(RecordingPolicyChecker::default());
    let delegate = h.factory.get_delegate(&state());

    let parent = StepContext::new();
    let child = delegate.start_span(&parent, "get");
    parent.cancellation().cancel();

    assert!(child.is_cancelled());
}

// ============================================================================
// Image fetching
// ============================================================================

#[tokio::test]
async fn test_fetch_image_wires_fetched_volume() {
    let h = harness(RecordingPolicyChecker::default());
    let delegate = h.factory.get_delegate(&state());

    let spec = delegate
        .fetch_image(
            &StepContext::new(),
            image(),
            VersionedResourceTypes::default(),
            true,
        )
        .await
        .unwrap();

    match spec {
        ImageSpec::Artifact { source, privileged } => {
            assert!(privileged);
            assert_eq!(source.volume().handle, h.image_volume);
        }
        other => panic!("expected artifact image, got {:?}", other),
    }

    assert_eq!(
        *h.fetcher.calls.lock().unwrap(),
        vec![("custom-resource".to_string(), true)]
    );

    let events = h.build.events();
    let image_get = events
        .iter()
        .find(|e| e.event_type == EventType::ImageGet)
        .unwrap();
    assert_eq!(image_get.payload, "custom-resource");
    assert_eq!(image_get.version, Some(version("image-digest")));

    let log = events
        .iter()
        .find(|e| e.event_type == EventType::Log)
        .unwrap();
    assert_eq!(log.payload, "fetching image\n");
    assert_eq!(log.origin, Some(Origin::Stderr));
}

#[tokio::test]
async fn test_fetch_image_checks_policy() {
    let h = harness(RecordingPolicyChecker::default());
    let delegate = h.factory.get_delegate(&state());

    delegate
        .fetch_image(
            &StepContext::new(),
            image(),
            VersionedResourceTypes::default(),
            false,
        )
        .await
        .unwrap();

    let inputs = h.policy.inputs.lock().unwrap().clone();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].action, ACTION_USE_IMAGE);
    assert_eq!(inputs[0].team, "some-team");
    assert_eq!(inputs[0].pipeline, "some-pipeline");
    assert_eq!(inputs[0].data["image_type"], "registry-image");
    assert_eq!(inputs[0].data["image_source"]["repository"], "some/image");
    assert_eq!(inputs[0].data["privileged"], false);
}

#[tokio::test]
async fn test_denied_image_is_not_fetched() {
    let h = harness(RecordingPolicyChecker {
        deny: Some(vec!["untrusted registry".to_string(), "too big".to_string()]),
        ..Default::default()
    });
    let delegate = h.factory.get_delegate(&state());

    let err = delegate
        .fetch_image(
            &StepContext::new(),
            image(),
            VersionedResourceTypes::default(),
            false,
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        StepError::PolicyDenied {
            action: ACTION_USE_IMAGE.to_string(),
            reasons: "untrusted registry; too big".to_string(),
        }
    );
    assert!(h.fetcher.calls.lock().unwrap().is_empty());
    assert!(h
        .build
        .events()
        .iter()
        .all(|e| e.event_type != EventType::ImageGet));
}
