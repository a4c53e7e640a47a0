//! Execution context threaded through a step.
//!
//! Carries cancellation, the active `tracing` span, and (when tracing is
//! enabled) a W3C trace context that resource scripts can continue through
//! the `TRACEPARENT` environment variable.

use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

/// W3C trace context of the active step span
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Start a new trace
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
        }
    }

    /// A new span within the same trace
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
        }
    }

    pub fn traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }

    /// Environment entry propagating this context to a child process
    pub fn env(&self) -> String {
        format!("TRACEPARENT={}", self.traceparent())
    }
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

#[derive(Debug, Clone)]
pub struct StepContext {
    cancel: CancellationToken,
    span: Span,
    trace: Option<TraceContext>,
}

impl Default for StepContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StepContext {
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            span: Span::none(),
            trace: None,
        }
    }

    /// Context for a child span, sharing this context's cancellation
    pub fn with_span(&self, span: Span, trace: Option<TraceContext>) -> Self {
        Self {
            cancel: self.cancel.clone(),
            span,
            trace,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the context is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }
}
