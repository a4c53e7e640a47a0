//! Container placement strategies.
//!
//! The pool narrows the workers down to those satisfying the worker spec;
//! a strategy then picks one. Strategies are opaque to steps, which only
//! pass them through.

use std::fmt::Debug;

use super::{ArtifactSource, ContainerSpec};

/// An eligible worker as seen by a strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCandidate {
    pub name: String,
    pub active_containers: usize,
}

pub trait ContainerPlacementStrategy: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Pick a worker from `candidates`, or `None` to refuse all of them
    fn choose(&self, candidates: &[WorkerCandidate], spec: &ContainerSpec) -> Option<String>;
}

/// Prefers the worker running the fewest containers
#[derive(Debug, Clone, Default)]
pub struct FewestContainersStrategy;

impl ContainerPlacementStrategy for FewestContainersStrategy {
    fn name(&self) -> &str {
        "fewest-build-containers"
    }

    fn choose(&self, candidates: &[WorkerCandidate], _spec: &ContainerSpec) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.active_containers
                    .cmp(&b.active_containers)
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(|c| c.name.clone())
    }
}

/// Prefers the worker already holding the most input volumes, so the fewest
/// bytes need streaming. Ties go to the least busy worker.
#[derive(Debug, Clone, Default)]
pub struct VolumeLocalityStrategy;

impl VolumeLocalityStrategy {
    fn local_inputs(candidate: &WorkerCandidate, spec: &ContainerSpec) -> usize {
        spec.inputs
            .iter()
            .filter(|input| match &input.source {
                ArtifactSource::Streamable(s) => s.exists_on(&candidate.name),
                ArtifactSource::Cache(_) => false,
            })
            .count()
    }
}

impl ContainerPlacementStrategy for VolumeLocalityStrategy {
    fn name(&self) -> &str {
        "volume-locality"
    }

    fn choose(&self, candidates: &[WorkerCandidate], spec: &ContainerSpec) -> Option<String> {
        candidates
            .iter()
            .max_by(|a, b| {
                Self::local_inputs(a, spec)
                    .cmp(&Self::local_inputs(b, spec))
                    .then_with(|| b.active_containers.cmp(&a.active_containers))
                    .then_with(|| b.name.cmp(&a.name))
            })
            .map(|c| c.name.clone())
    }
}
