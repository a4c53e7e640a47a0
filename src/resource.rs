//! Resource handle passed to the execution client.
//!
//! Carries the interpolated configuration sent to the resource script and,
//! once placed, the container it runs in.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domain::{Params, Source, Version, VersionResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub source: Source,
    pub params: Params,
    pub version: Option<Version>,

    /// Handle of the container the resource script runs in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl Resource {
    pub fn new(source: Source, params: Params, version: Option<Version>) -> Self {
        Self {
            source,
            params,
            version,
            container: None,
        }
    }

    pub fn bound_to(mut self, container_handle: impl Into<String>) -> Self {
        self.container = Some(container_handle.into());
        self
    }

    /// JSON request written to the `in` script's stdin
    pub fn in_request(&self) -> serde_json::Value {
        json!({
            "source": self.source,
            "params": self.params,
            "version": self.version,
        })
    }

    /// Parse the `{"version": ..., "metadata": [...]}` document an `in`
    /// script prints on stdout
    pub fn parse_version_result(stdout: &[u8]) -> Result<VersionResult, serde_json::Error> {
        serde_json::from_slice(stdout)
    }
}
