//! Shared per-build state handed to every step.
//!
//! Holds the artifact repository, step results keyed by plan ID, and the
//! build's variables. Cloning a `RunState` shares it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use crate::domain::{ArtifactRepository, PlanId};

use super::vars::Variables;

type StoredResult = Arc<dyn Any + Send + Sync>;

#[derive(Clone)]
pub struct RunState {
    repository: Arc<ArtifactRepository>,
    results: Arc<RwLock<HashMap<PlanId, StoredResult>>>,
    vars: Arc<dyn Variables>,
}

impl RunState {
    pub fn new(vars: Arc<dyn Variables>) -> Self {
        Self {
            repository: Arc::new(ArtifactRepository::new()),
            results: Arc::new(RwLock::new(HashMap::new())),
            vars,
        }
    }

    /// A separate scope sharing this build's variables, used for nested
    /// fetches (e.g. a custom type's image) whose outputs must not leak into
    /// the build's repository.
    pub fn child(&self) -> Self {
        Self::new(self.vars.clone())
    }

    pub fn artifact_repository(&self) -> &ArtifactRepository {
        &self.repository
    }

    /// Record the result of a step; each plan ID has a single writer
    pub fn store_result<T>(&self, plan_id: PlanId, value: T)
    where
        T: Any + Send + Sync,
    {
        self.results
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plan_id, Arc::new(value));
    }

    /// Read a step's result, if one of type `T` was stored
    pub fn result<T>(&self, plan_id: &PlanId) -> Option<T>
    where
        T: Any + Clone,
    {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plan_id)
            .and_then(|v| (**v).downcast_ref::<T>())
            .cloned()
    }

    pub fn has_result(&self, plan_id: &PlanId) -> bool {
        self.results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(plan_id)
    }

    pub fn variables(&self) -> &dyn Variables {
        self.vars.as_ref()
    }
}

impl Variables for RunState {
    fn get(&self, name: &str) -> Option<Value> {
        self.vars.get(name)
    }
}

impl std::fmt::Debug for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunState")
            .field("artifacts", &self.repository.len())
            .finish_non_exhaustive()
    }
}
