//! Local execution client.
//!
//! Runs resource scripts as subprocesses of this process, standing in for a
//! remote worker. `/opt/resource` inside the "container" maps to the script
//! directory registered for the base type, or to `rootfs/opt/resource` of a
//! fetched image volume. Each fetch writes into a fresh volume directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{resources_dir, GetArtifact};
use crate::error::StepError;
use crate::exec::StepContext;
use crate::resource::Resource;

use super::{Client, GetRequest, GetResult, ImageSpec, OutputSink, Volume, WorkerPool};

const RESOURCE_ROOT: &str = "/opt/resource";

pub struct LocalClient {
    pool: Arc<WorkerPool>,

    /// Directory holding one subdirectory per volume
    volumes_dir: PathBuf,

    /// Base type name -> directory containing its `in` script
    resource_types: HashMap<String, PathBuf>,
}

impl LocalClient {
    pub fn new(pool: Arc<WorkerPool>, volumes_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            volumes_dir: volumes_dir.into(),
            resource_types: HashMap::new(),
        }
    }

    /// Register the script directory for a base resource type
    pub fn with_resource_type(mut self, name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.resource_types.insert(name.into(), dir.into());
        self
    }

    pub fn volumes_dir(&self) -> &Path {
        &self.volumes_dir
    }

    /// Host directory standing in for `/opt/resource`
    fn resource_root(&self, image: &ImageSpec) -> Result<PathBuf, StepError> {
        match image {
            ImageSpec::ResourceType(name) => self.resource_types.get(name).cloned().ok_or_else(|| {
                StepError::Transport(format!("no scripts installed for resource type '{}'", name))
            }),
            ImageSpec::Artifact { source, .. } => {
                Ok(source.volume().path.join("rootfs").join("opt").join("resource"))
            }
        }
    }

    fn executable(&self, root: &Path, path: &str) -> PathBuf {
        match path.strip_prefix(RESOURCE_ROOT) {
            Some(rest) => root.join(rest.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }

    /// Run the `in` script into `volume_path`, returning its exit status and stdout
    async fn run_script(
        &self,
        ctx: &StepContext,
        request: &GetRequest,
        executable: &Path,
        volume_path: &Path,
    ) -> Result<(i32, Vec<u8>), StepError> {
        let get_dir = resources_dir("get");
        let args: Vec<String> = request
            .process_spec
            .args
            .iter()
            .map(|arg| {
                if *arg == get_dir {
                    volume_path.display().to_string()
                } else {
                    arg.clone()
                }
            })
            .collect();

        let env = request.container_spec.env.iter().filter_map(|entry| entry.split_once('='));

        request.delegate.starting().await;

        debug!(executable = %executable.display(), ?args, "Spawning resource script");
        let mut child = Command::new(executable)
            .args(&args)
            .envs(env)
            .current_dir(volume_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StepError::Transport(format!("failed to run {}: {}", executable.display(), e))
            })?;

        let request_body = serde_json::to_vec(&request.resource.in_request())
            .map_err(|e| StepError::Transport(format!("failed to encode request: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&request_body)
                .await
                .map_err(|e| StepError::Transport(format!("failed to write request: {}", e)))?;
            // Drop stdin to signal EOF
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| StepError::Transport("resource script has no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| StepError::Transport("resource script has no stderr".to_string()))?;
        let stderr_sink = request.process_spec.stderr.clone();

        let run = async {
            let mut output = Vec::new();
            let (status, read, ()) = tokio::join!(
                child.wait(),
                stdout.read_to_end(&mut output),
                forward_lines(stderr, stderr_sink),
            );
            let status = status.map_err(|e| StepError::Transport(e.to_string()))?;
            read.map_err(|e| StepError::Transport(e.to_string()))?;
            Ok::<_, StepError>((status, output))
        };

        let outcome = tokio::select! {
            result = run => Some(result),
            _ = ctx.cancelled() => None,
        };

        match outcome {
            Some(result) => {
                let (status, output) = result?;
                Ok((status.code().unwrap_or(-1), output))
            }
            None => {
                warn!("Cancelled, killing resource script");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill resource script");
                }
                Err(StepError::Interrupted)
            }
        }
    }

    /// Drop a volume that will never hold a complete fetch
    async fn discard_volume(&self, volume: &Volume) {
        self.pool.destroy_volume(&volume.handle);
        if let Err(e) = tokio::fs::remove_dir_all(&volume.path).await {
            warn!(handle = %volume.handle, error = %e, "Failed to remove volume directory");
        }
    }
}

#[async_trait]
impl Client for LocalClient {
    #[instrument(skip_all, fields(container = %request.container.handle, worker = %request.container.worker_name))]
    async fn run_get_step(
        &self,
        ctx: &StepContext,
        request: GetRequest,
    ) -> Result<GetResult, StepError> {
        let worker = request.container.worker_name.clone();
        let cache = &request.resource_cache;

        if cache.is_reusable() {
            if let Some(volume) = self.pool.find_resource_cache_volume(&worker, cache.id) {
                if let Some(version_result) = volume.version_result.clone() {
                    info!(handle = %volume.handle, cache = cache.id, "Reusing initialized resource cache volume");
                    return Ok(GetResult {
                        exit_status: 0,
                        version_result,
                        artifact: GetArtifact {
                            volume_handle: volume.handle,
                        },
                    });
                }
            }
        }

        let root = self.resource_root(&request.container_spec.image_spec)?;
        let executable = self.executable(&root, &request.process_spec.path);

        let volume_path = self.volumes_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&volume_path).await.map_err(|e| {
            StepError::Transport(format!(
                "failed to create volume directory {}: {}",
                volume_path.display(),
                e
            ))
        })?;
        let volume =
            self.pool
                .create_volume(&worker, request.container_spec.team_id, volume_path.clone())?;

        let (exit_status, output) =
            match self.run_script(ctx, &request, &executable, &volume_path).await {
                Ok(ran) => ran,
                Err(e) => {
                    self.discard_volume(&volume).await;
                    return Err(e);
                }
            };

        let artifact = GetArtifact {
            volume_handle: volume.handle.clone(),
        };

        if exit_status != 0 {
            info!(exit_status, "Resource script failed");
            self.discard_volume(&volume).await;
            return Ok(GetResult {
                exit_status,
                version_result: Default::default(),
                artifact,
            });
        }

        let version_result = match Resource::parse_version_result(&output) {
            Ok(version_result) => version_result,
            Err(e) => {
                self.discard_volume(&volume).await;
                return Err(StepError::Transport(format!(
                    "invalid version output from resource script: {}",
                    e
                )));
            }
        };

        self.pool
            .initialize_resource_cache(&worker, &volume.handle, cache.id, version_result.clone())?;

        info!(handle = %volume.handle, version = ?version_result.version, "Fetched resource");
        Ok(GetResult {
            exit_status,
            version_result,
            artifact,
        })
    }
}

async fn forward_lines<R>(reader: R, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => sink.write(&format!("{}\n", line)).await,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read resource script output");
                break;
            }
        }
    }
}

impl std::fmt::Debug for LocalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalClient")
            .field("volumes_dir", &self.volumes_dir)
            .field("resource_types", &self.resource_types)
            .finish_non_exhaustive()
    }
}
