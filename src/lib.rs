//! buildstep - Get-step execution core for a CI/CD orchestrator
//!
//! Fetches one version of a resource into a worker volume: resolves the
//! resource cache, fetches custom type images, places a container, runs the
//! resource's `in` script, and registers the result for downstream steps.
//!
//! # Architecture
//!
//! - The custom type chain of a plan is walked down to a base type
//! - Equivalent fetches share a content-addressed resource cache
//! - Steps report through delegates, which record build events
//! - Artifacts are volume handles, streamed between workers on demand
//!
//! # Modules
//!
//! - `domain`: Data structures (GetPlan, Artifact, BuildEvent)
//! - `core`: Shared state (RunState, variables, resource caches)
//! - `worker`: Pool, placement, artifact wiring, execution clients
//! - `exec`: Step contract and the Get step
//! - `engine`: Build-backed delegates and nested image fetches
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Fetch the version described by a plan file
//! buildstep get plan.yaml --var repo-uri=https://example.com/repo.git
//!
//! # List resource caches
//! buildstep caches
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exec;
pub mod resource;
pub mod worker;

// Re-export main types at crate root for convenience
pub use crate::core::{ResourceCache, ResourceCacheFactory, RunState};
pub use domain::{Artifact, ArtifactRepository, GetPlan, PlanId, VersionResult};
pub use error::{Result, StepError};
pub use exec::{GetStep, Step, StepContext};
pub use resource::Resource;
