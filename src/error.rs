//! Error taxonomy for step execution.
//!
//! Every failure below the step is propagated to the orchestrator as-is, so
//! all errors are `Clone + PartialEq`: the error a collaborator returns is
//! the error `Step::run` returns.

use std::time::Duration;

use thiserror::Error;

pub use crate::domain::TypeChainError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("invalid resource type chain: {0}")]
    TypeChain(#[from] TypeChainError),

    #[error("interpolation failed: {0}")]
    Vars(#[from] VarsError),

    #[error("resource cache: {0}")]
    Cache(#[from] CacheError),

    #[error("placement: {0}")]
    Placement(#[from] PlacementError),

    #[error("artifact wiring: {0}")]
    Wire(#[from] WireError),

    #[error("policy check failed for {action}: {reasons}")]
    PolicyDenied { action: String, reasons: String },

    #[error("fetching image for resource type '{resource_type}' failed: {message}")]
    ImageFetch {
        resource_type: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("build storage error: {0}")]
    Storage(String),

    #[error("step interrupted")]
    Interrupted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VarsError {
    #[error("undefined variable: {0}")]
    Undefined(String),

    #[error("variable '{var}' has no field '{field}'")]
    MissingField { var: String, field: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("resource cache storage unavailable: {0}")]
    Storage(String),

    #[error("resource cache record is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no workers satisfying: resource type '{resource_type}', tags {tags:?}, team {team_id}")]
    NoSatisfyingWorkers {
        resource_type: String,
        tags: Vec<String>,
        team_id: i64,
    },

    #[error("placement strategy '{strategy}' refused all {candidates} candidate workers")]
    StrategyRefused { strategy: String, candidates: usize },

    #[error("worker '{0}' is not registered")]
    UnknownWorker(String),

    #[error("creating container on worker '{worker}' failed: {message}")]
    ContainerCreation { worker: String, message: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("volume not found for artifact id {id} type {kind}")]
    VolumeNotFound { id: String, kind: String },

    #[error("volume lookup failed: {0}")]
    Lookup(String),

    #[error("streaming volume '{handle}' timed out after {timeout:?}")]
    StreamTimeout { handle: String, timeout: Duration },

    #[error("streaming volume '{handle}' failed: {message}")]
    Stream { handle: String, message: String },

    #[error("streaming volume '{0}' was interrupted")]
    Interrupted(String),
}

pub type Result<T> = std::result::Result<T, StepError>;
