//! Domain types for the step-execution core.
//!
//! This module contains the core data structures:
//! - Plan: Get plan nodes and custom resource type chains
//! - Metadata: Step and container identity
//! - Artifact: Step outputs and the per-build repository
//! - Events: Build events emitted by delegates

pub mod artifact;
pub mod events;
pub mod metadata;
pub mod plan;

// Re-export commonly used types
pub use artifact::{
    Artifact, ArtifactName, ArtifactRepository, CacheArtifact, GetArtifact, TaskArtifact,
};
pub use events::{BuildEvent, EventType, Origin};
pub use metadata::{resources_dir, ContainerMetadata, ContainerOwner, ContainerType, StepMetadata};
pub use plan::{
    GetPlan, ImageResource, MetadataField, Params, PlanId, Source, Tags, TypeChainError, Version,
    VersionResult, VersionedResourceType, VersionedResourceTypes, MAX_TYPE_CHAIN_DEPTH,
};
