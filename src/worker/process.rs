//! Process invocation inside a container.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

/// Executable run for Get steps inside the resource type's image
pub const RESOURCE_IN_PATH: &str = "/opt/resource/in";

/// Destination for a process's output stream
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write(&self, chunk: &str);
}

pub type OutputSink = Arc<dyn LogSink>;

/// Sink collecting output in memory
#[derive(Debug, Default)]
pub struct BufferSink {
    buffer: RwLock<String>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LogSink for BufferSink {
    async fn write(&self, chunk: &str) {
        self.buffer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(chunk);
    }
}

/// What to run in the container and where its output goes
#[derive(Clone)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl PartialEq for ProcessSpec {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
            && self.args == other.args
            && Arc::ptr_eq(&self.stdout, &other.stdout)
            && Arc::ptr_eq(&self.stderr, &other.stderr)
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("path", &self.path)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}
