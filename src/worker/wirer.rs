//! Artifact wiring: from named artifacts to container inputs.
//!
//! Task caches are passed through as placeholders; every other artifact must
//! resolve to a volume, which becomes a streamable source. When the container
//! lands on a different worker than the volume, the source streams the
//! volume across, directly between workers when P2P streaming is enabled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::domain::{Artifact, CacheArtifact};
use crate::error::WireError;
use crate::exec::StepContext;

use super::{Volume, VolumeFinder};

/// Compression applied to streamed volumes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Gzip,
    Zstd,
    Raw,
}

/// Peer-to-peer streaming settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingConfig {
    pub p2p_enabled: bool,
    pub p2p_timeout: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            p2p_enabled: false,
            p2p_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Transport that copies volume contents between workers
#[async_trait]
pub trait VolumeStreamer: Send + Sync {
    /// Stream directly from the source worker to the destination worker
    async fn stream_p2p(
        &self,
        source: &Volume,
        dest_worker: &str,
        dest_path: &str,
        compression: Compression,
    ) -> Result<(), WireError>;

    /// Stream through a central relay
    async fn stream_relayed(
        &self,
        source: &Volume,
        dest_worker: &str,
        dest_path: &str,
        compression: Compression,
    ) -> Result<(), WireError>;
}

/// An artifact backed by a concrete volume
#[derive(Debug, Clone, PartialEq)]
pub struct StreamableArtifactSource {
    artifact: Artifact,
    volume: Volume,
    compression: Compression,
    streaming: StreamingConfig,
}

impl StreamableArtifactSource {
    pub fn new(
        artifact: Artifact,
        volume: Volume,
        compression: Compression,
        streaming: StreamingConfig,
    ) -> Self {
        Self {
            artifact,
            volume,
            compression,
            streaming,
        }
    }

    pub fn artifact(&self) -> &Artifact {
        &self.artifact
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn streaming(&self) -> StreamingConfig {
        self.streaming
    }

    /// Whether the backing volume already lives on `worker`
    pub fn exists_on(&self, worker: &str) -> bool {
        self.volume.worker_name == worker
    }

    /// Make the volume's contents available at `dest_path` on `dest_worker`.
    ///
    /// A no-op when the volume already lives there. P2P transfers are bounded
    /// by the configured timeout; every transfer stops on cancellation.
    #[instrument(skip(self, ctx, streamer), fields(handle = %self.volume.handle, from = %self.volume.worker_name))]
    pub async fn stream_to(
        &self,
        ctx: &StepContext,
        dest_worker: &str,
        dest_path: &str,
        streamer: &dyn VolumeStreamer,
    ) -> Result<(), WireError> {
        if self.exists_on(dest_worker) {
            debug!("Volume already on destination worker");
            return Ok(());
        }

        let transfer = async {
            if self.streaming.p2p_enabled {
                let p2p =
                    streamer.stream_p2p(&self.volume, dest_worker, dest_path, self.compression);
                match tokio::time::timeout(self.streaming.p2p_timeout, p2p).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(timeout = ?self.streaming.p2p_timeout, "P2P stream timed out");
                        Err(WireError::StreamTimeout {
                            handle: self.volume.handle.clone(),
                            timeout: self.streaming.p2p_timeout,
                        })
                    }
                }
            } else {
                streamer
                    .stream_relayed(&self.volume, dest_worker, dest_path, self.compression)
                    .await
            }
        };

        tokio::select! {
            result = transfer => result,
            _ = ctx.cancelled() => Err(WireError::Interrupted(self.volume.handle.clone())),
        }
    }
}

/// A task cache whose volume is found by the worker that claims it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheArtifactSource {
    artifact: CacheArtifact,
}

impl CacheArtifactSource {
    pub fn new(artifact: CacheArtifact) -> Self {
        Self { artifact }
    }

    pub fn artifact(&self) -> &CacheArtifact {
        &self.artifact
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactSource {
    Cache(CacheArtifactSource),
    Streamable(StreamableArtifactSource),
}

/// An artifact mounted at a path inside a container
#[derive(Debug, Clone, PartialEq)]
pub struct InputSource {
    pub source: ArtifactSource,
    pub destination_path: String,
}

/// Converts artifacts into container inputs
#[derive(Clone)]
pub struct ArtifactWirer {
    compression: Compression,
    volume_finder: Arc<dyn VolumeFinder>,
    streaming: StreamingConfig,
}

impl ArtifactWirer {
    pub fn new(
        compression: Compression,
        volume_finder: Arc<dyn VolumeFinder>,
        streaming: StreamingConfig,
    ) -> Self {
        Self {
            compression,
            volume_finder,
            streaming,
        }
    }

    /// Wire every artifact in `inputs` (keyed by destination path).
    ///
    /// Fails the whole batch on the first artifact without a volume; inputs
    /// are returned in path order.
    #[instrument(skip(self, inputs), fields(inputs = inputs.len()))]
    pub async fn wire_inputs_and_caches(
        &self,
        team_id: i64,
        inputs: &BTreeMap<String, Artifact>,
    ) -> Result<Vec<InputSource>, WireError> {
        let mut wired = Vec::with_capacity(inputs.len());

        for (path, artifact) in inputs {
            let source = match artifact {
                Artifact::Cache(cache) => {
                    ArtifactSource::Cache(CacheArtifactSource::new(cache.clone()))
                }
                other => ArtifactSource::Streamable(self.streamable(team_id, other).await?),
            };

            wired.push(InputSource {
                source,
                destination_path: path.clone(),
            });
        }

        Ok(wired)
    }

    /// Wire an artifact used as a container image; images are not team-scoped
    pub async fn wire_image(&self, artifact: &Artifact) -> Result<StreamableArtifactSource, WireError> {
        self.streamable(0, artifact).await
    }

    async fn streamable(
        &self,
        team_id: i64,
        artifact: &Artifact,
    ) -> Result<StreamableArtifactSource, WireError> {
        let id = artifact.id();
        let volume = self
            .volume_finder
            .find_volume(team_id, &id)
            .await?
            .ok_or_else(|| WireError::VolumeNotFound {
                id: id.clone(),
                kind: artifact.kind().to_string(),
            })?;

        debug!(artifact = %id, worker = %volume.worker_name, "Wired artifact volume");
        Ok(StreamableArtifactSource::new(
            artifact.clone(),
            volume,
            self.compression,
            self.streaming,
        ))
    }
}

impl std::fmt::Debug for ArtifactWirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactWirer")
            .field("compression", &self.compression)
            .field("streaming", &self.streaming)
            .finish_non_exhaustive()
    }
}
