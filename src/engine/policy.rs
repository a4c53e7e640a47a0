//! Policy checks on what a build is about to use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action checked before a custom type's image is used
pub const ACTION_USE_IMAGE: &str = "UseImage";

/// What is being checked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInput {
    pub action: String,
    pub team: String,
    pub pipeline: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub allowed: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl PolicyResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reasons: Vec::new(),
        }
    }

    pub fn deny(reasons: Vec<String>) -> Self {
        Self {
            allowed: false,
            reasons,
        }
    }
}

#[async_trait]
pub trait PolicyChecker: Send + Sync {
    /// Whether this checker cares about `action` at all
    fn should_check(&self, action: &str) -> bool;

    async fn check(&self, input: &PolicyInput) -> PolicyResult;
}

/// Checker used when no policy agent is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllPolicyChecker;

#[async_trait]
impl PolicyChecker for AllowAllPolicyChecker {
    fn should_check(&self, _action: &str) -> bool {
        false
    }

    async fn check(&self, _input: &PolicyInput) -> PolicyResult {
        PolicyResult::allow()
    }
}
