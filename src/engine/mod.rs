//! Build engine glue around steps.
//!
//! This module contains:
//! - Build: sinks for build events and saved versions
//! - Delegate: build-backed step delegates and their factory
//! - Image: fetching custom type images through nested Get steps
//! - Policy: checks on images a build is about to use
//! - Clock: injectable time source

pub mod build;
pub mod clock;
pub mod delegate;
pub mod image;
pub mod policy;

// Re-export commonly used types
pub use build::{Build, FileBuild, InMemoryBuild, SavedOutput};
pub use clock::{Clock, SystemClock};
pub use delegate::{BuildStepDelegate, DelegateFactory};
pub use image::{FetchedImage, ImageFetcher, NestedGetImageFetcher};
pub use policy::{AllowAllPolicyChecker, PolicyChecker, PolicyInput, PolicyResult, ACTION_USE_IMAGE};
