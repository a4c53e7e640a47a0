//! Step execution.
//!
//! This module contains:
//! - Context: cancellation, span and trace context for one step
//! - Delegate: the event channel a step reports through
//! - GetStep: fetches a resource version into a volume

pub mod context;
pub mod delegate;
pub mod get_step;

use async_trait::async_trait;

use crate::core::RunState;
use crate::error::StepError;

// Re-export commonly used types
pub use context::{StepContext, TraceContext};
pub use delegate::{GetDelegate, GetDelegateFactory};
pub use get_step::GetStep;

/// A unit of work in a build plan.
///
/// `Ok(false)` means the step ran but did not succeed (e.g. a resource script
/// exited non-zero); errors are reserved for failures to run at all.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, ctx: &StepContext, state: &RunState) -> Result<bool, StepError>;
}
