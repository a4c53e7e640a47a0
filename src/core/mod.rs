//! Core state shared by steps.
//!
//! This module contains:
//! - Vars: `((var))` interpolation of sources and params
//! - RunState: per-build artifacts, step results and variables
//! - ResourceCache: content-addressed cache identities and their stores

pub mod resource_cache;
pub mod run_state;
pub mod vars;

// Re-export commonly used types
pub use resource_cache::{
    CacheKey, FileResourceCacheFactory, InMemoryResourceCacheFactory, ResourceCache,
    ResourceCacheFactory,
};
pub use run_state::RunState;
pub use vars::{StaticVariables, Variables};
