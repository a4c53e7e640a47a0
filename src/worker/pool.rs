//! In-memory worker registry.
//!
//! Tracks workers with their containers and volumes, places containers on
//! workers satisfying a worker spec, and answers volume lookups. All state
//! sits behind one lock held only for map operations, never across awaits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::{ContainerMetadata, ContainerOwner, VersionResult};
use crate::error::{PlacementError, WireError};
use crate::exec::StepContext;

use super::placement::{ContainerPlacementStrategy, WorkerCandidate};
use super::{Container, ContainerSpec, Pool, Volume, VolumeFinder, WorkerInfo, WorkerSpec};

#[derive(Debug)]
struct WorkerState {
    info: WorkerInfo,
    containers: HashMap<ContainerOwner, Container>,
    volumes: HashMap<String, Volume>,
}

impl WorkerState {
    fn new(info: WorkerInfo) -> Self {
        Self {
            info,
            containers: HashMap::new(),
            volumes: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: RwLock<HashMap<String, WorkerState>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing (and forgetting the state of) any worker
    /// with the same name
    pub fn register_worker(&self, info: WorkerInfo) {
        info!(worker = %info.name, types = ?info.resource_types, "Worker registered");
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(info.name.clone(), WorkerState::new(info));
    }

    pub fn container_count(&self, worker: &str) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker)
            .map(|w| w.containers.len())
            .unwrap_or(0)
    }

    /// Forget a container, freeing its slot on the worker
    pub fn destroy_container(&self, container: &Container) -> bool {
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&container.worker_name)
            .and_then(|w| w.containers.remove(&container.owner))
            .is_some()
    }

    /// Create an empty volume on a worker
    pub fn create_volume(
        &self,
        worker: &str,
        team_id: i64,
        path: PathBuf,
    ) -> Result<Volume, PlacementError> {
        let handle = Uuid::new_v4().to_string();
        let volume = Volume {
            handle: handle.clone(),
            worker_name: worker.to_string(),
            team_id,
            path,
            resource_cache_id: None,
            version_result: None,
        };

        self.register_volume(volume.clone())?;
        Ok(volume)
    }

    /// Track a volume that already exists on a worker
    fn register_volume(&self, volume: Volume) -> Result<(), PlacementError> {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        let worker = workers
            .get_mut(&volume.worker_name)
            .ok_or_else(|| PlacementError::UnknownWorker(volume.worker_name.clone()))?;

        debug!(handle = %volume.handle, worker = %volume.worker_name, "Volume registered");
        worker.volumes.insert(volume.handle.clone(), volume);
        Ok(())
    }

    /// Mark a volume as holding a complete fetch of a resource cache.
    ///
    /// The volume becomes shared across teams so any build resolving the same
    /// cache can reuse it.
    pub fn initialize_resource_cache(
        &self,
        worker: &str,
        handle: &str,
        cache_id: u64,
        version_result: VersionResult,
    ) -> Result<Volume, PlacementError> {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
        let volume = workers
            .get_mut(worker)
            .ok_or_else(|| PlacementError::UnknownWorker(worker.to_string()))?
            .volumes
            .get_mut(handle)
            .ok_or_else(|| PlacementError::ContainerCreation {
                worker: worker.to_string(),
                message: format!("volume {} not found", handle),
            })?;

        volume.team_id = 0;
        volume.resource_cache_id = Some(cache_id);
        volume.version_result = Some(version_result);
        Ok(volume.clone())
    }

    /// Forget a volume, returning it if it was tracked
    pub fn destroy_volume(&self, handle: &str) -> Option<Volume> {
        let volume = self
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
            .find_map(|w| w.volumes.remove(handle));

        if let Some(volume) = &volume {
            debug!(handle = %volume.handle, worker = %volume.worker_name, "Volume destroyed");
        }
        volume
    }

    /// Look up a volume by handle regardless of team
    pub fn volume(&self, handle: &str) -> Option<Volume> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find_map(|w| w.volumes.get(handle))
            .cloned()
    }

    /// Initialized volume for a resource cache on `worker`, if any
    pub fn find_resource_cache_volume(&self, worker: &str, cache_id: u64) -> Option<Volume> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker)?
            .volumes
            .values()
            .find(|v| v.resource_cache_id == Some(cache_id))
            .cloned()
    }
}

#[async_trait]
impl VolumeFinder for WorkerPool {
    async fn find_volume(&self, team_id: i64, handle: &str) -> Result<Option<Volume>, WireError> {
        let workers = self.workers.read().unwrap_or_else(PoisonError::into_inner);

        Ok(workers
            .values()
            .filter_map(|w| w.volumes.get(handle))
            .find(|v| v.visible_to(team_id))
            .cloned())
    }
}

#[async_trait]
impl Pool for WorkerPool {
    #[instrument(skip_all, fields(owner = ?owner, resource_type = %worker_spec.resource_type, strategy = strategy.name()))]
    async fn select_container(
        &self,
        _ctx: &StepContext,
        owner: &ContainerOwner,
        strategy: &dyn ContainerPlacementStrategy,
        container_spec: &ContainerSpec,
        worker_spec: &WorkerSpec,
        metadata: &ContainerMetadata,
    ) -> Result<Container, PlacementError> {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);

        let existing = workers
            .values()
            .filter(|w| w.info.satisfies(worker_spec))
            .find_map(|w| w.containers.get(owner))
            .cloned();
        if let Some(container) = existing {
            debug!(handle = %container.handle, worker = %container.worker_name, "Reusing container");
            return Ok(container);
        }

        let candidates = candidates(&workers, worker_spec);
        if candidates.is_empty() {
            return Err(PlacementError::NoSatisfyingWorkers {
                resource_type: worker_spec.resource_type.clone(),
                tags: worker_spec.tags.clone(),
                team_id: worker_spec.team_id,
            });
        }

        let chosen = strategy
            .choose(&candidates, container_spec)
            .ok_or_else(|| PlacementError::StrategyRefused {
                strategy: strategy.name().to_string(),
                candidates: candidates.len(),
            })?;

        let worker = workers
            .get_mut(&chosen)
            .ok_or_else(|| PlacementError::UnknownWorker(chosen.clone()))?;

        let container = Container {
            handle: Uuid::new_v4().to_string(),
            worker_name: chosen.clone(),
            owner: owner.clone(),
            metadata: metadata.clone(),
        };
        worker.containers.insert(owner.clone(), container.clone());

        info!(handle = %container.handle, worker = %chosen, "Container placed");
        Ok(container)
    }

    async fn release_container(&self, container: &Container) {
        if self.destroy_container(container) {
            debug!(handle = %container.handle, worker = %container.worker_name, "Container released");
        }
    }

    fn volume_finder(self: Arc<Self>) -> Arc<dyn VolumeFinder> {
        self
    }
}

/// Workers eligible for `spec` with their live container counts, by name
fn candidates(workers: &HashMap<String, WorkerState>, spec: &WorkerSpec) -> Vec<WorkerCandidate> {
    let mut candidates: Vec<_> = workers
        .values()
        .filter(|w| w.info.satisfies(spec))
        .map(|w| WorkerCandidate {
            name: w.info.name.clone(),
            active_containers: w.containers.len(),
        })
        .collect();
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    candidates
}
