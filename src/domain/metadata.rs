//! Step and container identity.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::plan::PlanId;

/// Root under which step working directories are mounted
const RESOURCES_ROOT: &str = "/tmp/build";

/// Canonical mount directory for a resource operation, e.g. `/tmp/build/get`
pub fn resources_dir(suffix: &str) -> String {
    format!("{}/{}", RESOURCES_ROOT, suffix)
}

/// Identity of the build, pipeline and team a step runs for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub team_id: i64,
    pub team_name: String,
    pub build_id: i64,
    pub build_name: String,
    #[serde(default)]
    pub pipeline_id: i64,
    #[serde(default)]
    pub pipeline_name: String,
    #[serde(default)]
    pub job_id: i64,
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub external_url: String,
}

impl StepMetadata {
    /// Environment handed to resource scripts.
    ///
    /// Build and team identity are always present; pipeline, job and URL
    /// fields only when set.
    pub fn env(&self) -> Vec<String> {
        let mut env = vec![
            format!("BUILD_ID={}", self.build_id),
            format!("BUILD_NAME={}", self.build_name),
            format!("BUILD_TEAM_ID={}", self.team_id),
            format!("BUILD_TEAM_NAME={}", self.team_name),
        ];

        if self.pipeline_id != 0 {
            env.push(format!("BUILD_PIPELINE_ID={}", self.pipeline_id));
        }
        if !self.pipeline_name.is_empty() {
            env.push(format!("BUILD_PIPELINE_NAME={}", self.pipeline_name));
        }
        if self.job_id != 0 {
            env.push(format!("BUILD_JOB_ID={}", self.job_id));
        }
        if !self.job_name.is_empty() {
            env.push(format!("BUILD_JOB_NAME={}", self.job_name));
        }
        if !self.external_url.is_empty() {
            env.push(format!("ATC_EXTERNAL_URL={}", self.external_url));
        }

        env
    }
}

/// Kind of step a container was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    Get,
    Put,
    Task,
    Check,
}

impl Default for ContainerType {
    fn default() -> Self {
        Self::Get
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "get",
            Self::Put => "put",
            Self::Task => "task",
            Self::Check => "check",
        };
        f.write_str(s)
    }
}

/// Bookkeeping attached to a container; not part of its identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub working_directory: String,
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    pub step_name: String,
    #[serde(default)]
    pub pipeline_id: i64,
}

/// Who a container belongs to; identical owners may share a container
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerOwner {
    pub build_id: i64,
    pub plan_id: PlanId,
    pub team_id: i64,
}

impl ContainerOwner {
    pub fn build_step(build_id: i64, plan_id: PlanId, team_id: i64) -> Self {
        Self {
            build_id,
            plan_id,
            team_id,
        }
    }
}
