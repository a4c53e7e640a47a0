//! Nested Image Fetch Integration Tests
//!
//! Custom type images fetched through nested Get steps on a real worker pool.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use buildstep::core::{InMemoryResourceCacheFactory, RunState, StaticVariables};
use buildstep::domain::{
    Artifact, ArtifactName, GetArtifact, ImageResource, StepMetadata, Version, VersionResult,
    VersionedResourceType, VersionedResourceTypes,
};
use buildstep::engine::{FetchedImage, ImageFetcher, NestedGetImageFetcher};
use buildstep::error::StepError;
use buildstep::exec::StepContext;
use buildstep::worker::{
    ArtifactWirer, BufferSink, Client, Compression, FewestContainersStrategy, GetRequest,
    GetResult, ImageSpec, LogSink, StreamingConfig, WorkerInfo, WorkerPool,
};

/// Client that "fetches" by creating an empty volume on the placed worker
struct VolumeClient {
    pool: Arc<WorkerPool>,
    exit_status: i32,
    images: Mutex<Vec<ImageSpec>>,
}

#[async_trait]
impl Client for VolumeClient {
    async fn run_get_step(
        &self,
        _ctx: &StepContext,
        request: GetRequest,
    ) -> Result<GetResult, StepError> {
        self.images
            .lock()
            .unwrap()
            .push(request.container_spec.image_spec.clone());
        request.process_spec.stderr.write("pulling image\n").await;

        let volume = self
            .pool
            .create_volume(&request.container.worker_name, 0, PathBuf::from("/volumes/image"))?;

        Ok(GetResult {
            exit_status: self.exit_status,
            version_result: VersionResult {
                version: digest(),
                metadata: vec![],
            },
            artifact: GetArtifact {
                volume_handle: volume.handle,
            },
        })
    }
}

fn digest() -> Version {
    Version::from([("digest".to_string(), "sha256:abc".to_string())])
}

fn image() -> ImageResource {
    ImageResource {
        name: "my-type".to_string(),
        type_name: "registry-image".to_string(),
        source: [("repository".to_string(), json!("my/type"))]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

struct Harness {
    client: Arc<VolumeClient>,
    fetcher: Arc<NestedGetImageFetcher>,
    logs: Arc<BufferSink>,
}

fn harness(exit_status: i32) -> Harness {
    let pool = Arc::new(WorkerPool::new());
    pool.register_worker(WorkerInfo {
        name: "some-worker".to_string(),
        resource_types: vec!["registry-image".to_string()],
        ..Default::default()
    });

    let client = Arc::new(VolumeClient {
        pool: pool.clone(),
        exit_status,
        images: Mutex::new(Vec::new()),
    });
    let wirer = ArtifactWirer::new(Compression::Gzip, pool.clone(), StreamingConfig::default());

    let fetcher = Arc::new(NestedGetImageFetcher::new(
        StepMetadata {
            team_id: 1,
            build_id: 42,
            ..Default::default()
        },
        Arc::new(InMemoryResourceCacheFactory::new()),
        Arc::new(FewestContainersStrategy),
        client.clone(),
        pool,
        wirer,
    ));

    Harness {
        client,
        fetcher,
        logs: Arc::new(BufferSink::new()),
    }
}

impl Harness {
    async fn fetch(
        &self,
        state: &RunState,
        image: ImageResource,
        types: VersionedResourceTypes,
    ) -> Result<FetchedImage, StepError> {
        self.fetcher
            .clone()
            .fetch(
                &StepContext::new(),
                state,
                image,
                types,
                false,
                self.logs.clone(),
            )
            .await
    }
}

fn state() -> RunState {
    RunState::new(Arc::new(StaticVariables::new()))
}

#[tokio::test]
async fn test_fetches_image_from_base_type() {
    let h = harness(0);
    let state = state();

    let fetched = h
        .fetch(&state, image(), VersionedResourceTypes::default())
        .await
        .unwrap();

    assert!(matches!(fetched.artifact, Artifact::Get(_)));
    assert_eq!(fetched.version, Some(digest()));
    assert_eq!(
        *h.client.images.lock().unwrap(),
        vec![ImageSpec::ResourceType("registry-image".to_string())]
    );
    assert_eq!(h.logs.contents(), "pulling image\n");

    // The image stays out of the build's own artifacts
    assert!(state
        .artifact_repository()
        .artifact_for(&ArtifactName::new("my-type"))
        .is_none());
}

#[tokio::test]
async fn test_image_of_custom_type_is_fetched_first() {
    let h = harness(0);
    let types = VersionedResourceTypes::new(vec![VersionedResourceType {
        name: "image-type".to_string(),
        type_name: "registry-image".to_string(),
        source: [("repository".to_string(), json!("image/type"))]
            .into_iter()
            .collect(),
        ..Default::default()
    }]);
    let image = ImageResource {
        type_name: "image-type".to_string(),
        ..image()
    };

    let fetched = h.fetch(&state(), image, types).await.unwrap();

    let images = h.client.images.lock().unwrap().clone();
    assert_eq!(images.len(), 2);
    assert_eq!(images[0], ImageSpec::ResourceType("registry-image".to_string()));
    match &images[1] {
        ImageSpec::Artifact { source, .. } => {
            let nested = Artifact::Get(GetArtifact {
                volume_handle: source.volume().handle.clone(),
            });
            assert_ne!(nested, fetched.artifact);
        }
        other => panic!("expected the nested image, got {:?}", other),
    }
}

#[tokio::test]
async fn test_failed_image_fetch_is_an_error() {
    let h = harness(1);

    let err = h
        .fetch(&state(), image(), VersionedResourceTypes::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        StepError::ImageFetch { ref resource_type, .. } if resource_type == "my-type"
    ));
}
