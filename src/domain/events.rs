//! Build events emitted by step delegates.
//!
//! Every lifecycle transition of a step is recorded as an immutable event
//! against the owning build.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::{MetadataField, PlanId, Version, VersionResult};

/// A single event in a build's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred, as reported by the delegate's clock
    pub timestamp: DateTime<Utc>,

    /// The build this event belongs to
    pub build_id: i64,

    /// Plan node that emitted the event (if applicable)
    pub plan_id: Option<PlanId>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable payload (log chunk, message)
    pub payload: String,

    /// Output stream for log events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,

    /// Worker chosen for the step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    /// Exit status for finish events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,

    /// Version reported by the resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<MetadataField>,

    /// Error message if the step errored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildEvent {
    pub fn new(
        build_id: i64,
        plan_id: Option<PlanId>,
        event_type: EventType,
        payload: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            build_id,
            plan_id,
            event_type,
            payload: payload.into(),
            origin: None,
            worker: None,
            exit_status: None,
            version: None,
            metadata: Vec::new(),
            error: None,
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_exit_status(mut self, status: i32) -> Self {
        self.exit_status = Some(status);
        self
    }

    pub fn with_version_result(mut self, result: &VersionResult) -> Self {
        self.version = Some(result.version.clone());
        self.metadata = result.metadata.clone();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of events a step can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The step began resolving its inputs
    Initialize,

    /// A worker was chosen for the step's container
    SelectedWorker,

    /// The resource script is about to run
    Start,

    /// A chunk of script output
    Log,

    /// The resource script exited
    Finish,

    /// A custom type's image was fetched
    ImageGet,

    /// The step failed with an error (not a non-zero exit)
    Error,
}

/// Output stream a log chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Stdout,
    Stderr,
}
