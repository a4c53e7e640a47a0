//! Build sinks: where delegates record events and fetched versions.
//!
//! - `InMemoryBuild`: kept in memory, used by tests and nested fetches
//! - `FileBuild`: newline-delimited JSON under a build directory, one file
//!   for events and one for saved outputs

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::domain::{BuildEvent, VersionResult};
use crate::error::StepError;

/// A version a Get step saved against a pipeline resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedOutput {
    pub resource: String,
    pub resource_type: String,
    pub version_result: VersionResult,
}

#[async_trait]
pub trait Build: Send + Sync {
    fn id(&self) -> i64;

    async fn save_event(&self, event: BuildEvent) -> Result<(), StepError>;

    async fn save_output(&self, output: SavedOutput) -> Result<(), StepError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBuild {
    id: i64,
    events: RwLock<Vec<BuildEvent>>,
    outputs: RwLock<Vec<SavedOutput>>,
}

impl InMemoryBuild {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<BuildEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn outputs(&self) -> Vec<SavedOutput> {
        self.outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Build for InMemoryBuild {
    fn id(&self) -> i64 {
        self.id
    }

    async fn save_event(&self, event: BuildEvent) -> Result<(), StepError> {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }

    async fn save_output(&self, output: SavedOutput) -> Result<(), StepError> {
        self.outputs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(output);
        Ok(())
    }
}

/// File-based build log using JSONL format
#[derive(Debug)]
pub struct FileBuild {
    id: i64,

    /// Directory containing the build's files
    build_dir: PathBuf,

    events_path: PathBuf,
    outputs_path: PathBuf,
}

impl FileBuild {
    /// Create or open the build log under `base_dir/<id>`
    pub async fn open(base_dir: impl AsRef<Path>, id: i64) -> Result<Self, StepError> {
        let build_dir = base_dir.as_ref().join(id.to_string());

        fs::create_dir_all(&build_dir).await.map_err(|e| {
            StepError::Storage(format!(
                "failed to create build directory {}: {}",
                build_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            id,
            events_path: build_dir.join("events.jsonl"),
            outputs_path: build_dir.join("outputs.jsonl"),
            build_dir,
        })
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<BuildEvent>, StepError> {
        read_lines(&self.events_path).await
    }

    pub async fn outputs(&self) -> Result<Vec<SavedOutput>, StepError> {
        read_lines(&self.outputs_path).await
    }
}

#[async_trait]
impl Build for FileBuild {
    fn id(&self) -> i64 {
        self.id
    }

    async fn save_event(&self, event: BuildEvent) -> Result<(), StepError> {
        append_line(&self.events_path, &event).await
    }

    async fn save_output(&self, output: SavedOutput) -> Result<(), StepError> {
        append_line(&self.outputs_path, &output).await
    }
}

async fn append_line<T: Serialize>(path: &Path, record: &T) -> Result<(), StepError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StepError::Storage(format!("failed to open {}: {}", path.display(), e)))?;

    let json = serde_json::to_string(record)
        .map_err(|e| StepError::Storage(format!("failed to serialize record: {}", e)))?;
    file.write_all(format!("{}\n", json).as_bytes())
        .await
        .map_err(|e| StepError::Storage(format!("failed to write {}: {}", path.display(), e)))?;
    file.flush()
        .await
        .map_err(|e| StepError::Storage(format!("failed to flush {}: {}", path.display(), e)))?;

    Ok(())
}

async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StepError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .await
        .map_err(|e| StepError::Storage(format!("failed to open {}: {}", path.display(), e)))?;

    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| StepError::Storage(format!("failed to read {}: {}", path.display(), e)))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .map_err(|e| StepError::Storage(format!("failed to parse record: {}", e)))?;
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventType, PlanId};
    use chrono::Utc;
    use tempfile::TempDir;

    fn event(event_type: EventType) -> BuildEvent {
        BuildEvent::new(7, Some(PlanId::new("1")), event_type, "", Utc::now())
    }

    #[tokio::test]
    async fn test_file_build_replays_in_order() {
        let dir = TempDir::new().unwrap();
        let build = FileBuild::open(dir.path(), 7).await.unwrap();

        build.save_event(event(EventType::Initialize)).await.unwrap();
        build.save_event(event(EventType::Start)).await.unwrap();
        build.save_event(event(EventType::Finish)).await.unwrap();

        let reopened = FileBuild::open(dir.path(), 7).await.unwrap();
        let types: Vec<_> = reopened
            .replay()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();

        assert_eq!(
            types,
            vec![EventType::Initialize, EventType::Start, EventType::Finish]
        );
    }

    #[tokio::test]
    async fn test_file_build_outputs() {
        let dir = TempDir::new().unwrap();
        let build = FileBuild::open(dir.path(), 3).await.unwrap();
        assert!(build.outputs().await.unwrap().is_empty());

        let output = SavedOutput {
            resource: "repo".to_string(),
            resource_type: "git".to_string(),
            version_result: VersionResult::default(),
        };
        build.save_output(output.clone()).await.unwrap();

        assert_eq!(build.outputs().await.unwrap(), vec![output]);
        assert!(build.build_dir().ends_with("3"));
    }

    #[tokio::test]
    async fn test_in_memory_build() {
        let build = InMemoryBuild::new(9);
        build.save_event(event(EventType::Log)).await.unwrap();

        assert_eq!(build.id(), 9);
        assert_eq!(build.events().len(), 1);
        assert!(build.outputs().is_empty());
    }
}
