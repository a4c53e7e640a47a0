//! Configuration for the local buildstep runtime.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (BUILDSTEP_HOME)
//! 2. Config file (.buildstep/config.yaml)
//! 3. Defaults (~/.buildstep)
//!
//! Config file discovery:
//! - Searches current directory and parents for .buildstep/config.yaml
//! - Paths in config file are relative to the .buildstep/ directory

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::worker::{Compression, StreamingConfig, WorkerInfo};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_P2P_TIMEOUT_SECONDS: u64 = 300;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub streaming: Option<StreamingFileConfig>,
    #[serde(default)]
    pub tracing: Option<TracingConfig>,
    #[serde(default)]
    pub worker: Option<WorkerConfig>,
    /// Base resource type -> directory holding its scripts
    #[serde(default)]
    pub resource_types: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Runtime state directory (relative to .buildstep/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingFileConfig {
    pub p2p_enabled: Option<bool>,
    pub p2p_timeout_seconds: Option<u64>,
    pub compression: Option<Compression>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub team_id: Option<i64>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to buildstep home (caches, builds, volumes)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub streaming: StreamingSettings,
    pub tracing_enabled: bool,
    pub worker: WorkerSettings,
    pub resource_types: HashMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamingSettings {
    pub p2p_enabled: bool,
    pub p2p_timeout_seconds: u64,
    pub compression: Compression,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            p2p_enabled: false,
            p2p_timeout_seconds: DEFAULT_P2P_TIMEOUT_SECONDS,
            compression: Compression::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub name: String,
    pub tags: Vec<String>,
    pub team_id: Option<i64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            tags: Vec::new(),
            team_id: None,
        }
    }
}

impl ResolvedConfig {
    pub fn streaming_config(&self) -> StreamingConfig {
        StreamingConfig {
            p2p_enabled: self.streaming.p2p_enabled,
            p2p_timeout: Duration::from_secs(self.streaming.p2p_timeout_seconds),
        }
    }

    /// The local worker, offering every configured base type
    pub fn worker_info(&self) -> WorkerInfo {
        let mut resource_types: Vec<String> = self.resource_types.keys().cloned().collect();
        resource_types.sort();

        WorkerInfo {
            name: self.worker.name.clone(),
            resource_types,
            tags: self.worker.tags.clone(),
            team_id: self.worker.team_id,
        }
    }

    /// JSONL store of resource caches
    pub fn caches_path(&self) -> PathBuf {
        self.home.join("caches.jsonl")
    }

    /// Per-build event logs
    pub fn builds_dir(&self) -> PathBuf {
        self.home.join("builds")
    }

    /// Volume directories written by resource scripts
    pub fn volumes_dir(&self) -> PathBuf {
        self.home.join("volumes")
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".buildstep").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    load_config_from(find_config_file())
}

fn load_config_from(config_file: Option<PathBuf>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".buildstep");
    let env_home = std::env::var("BUILDSTEP_HOME").ok().map(PathBuf::from);

    let Some(config_path) = config_file else {
        return Ok(ResolvedConfig {
            home: env_home.unwrap_or(default_home),
            config_file: None,
            streaming: StreamingSettings::default(),
            tracing_enabled: false,
            worker: WorkerSettings::default(),
            resource_types: HashMap::new(),
        });
    };

    let config = load_config_file(&config_path)?;
    let config_dir = config_path.parent().unwrap_or(Path::new("."));

    let home = match (env_home, &config.paths.home) {
        (Some(home), _) => home,
        (None, Some(home_path)) => resolve_path(config_dir, home_path),
        (None, None) => default_home,
    };

    let streaming = config
        .streaming
        .as_ref()
        .map(|s| StreamingSettings {
            p2p_enabled: s.p2p_enabled.unwrap_or(false),
            p2p_timeout_seconds: s.p2p_timeout_seconds.unwrap_or(DEFAULT_P2P_TIMEOUT_SECONDS),
            compression: s.compression.unwrap_or_default(),
        })
        .unwrap_or_default();

    let worker = config
        .worker
        .as_ref()
        .map(|w| WorkerSettings {
            name: w.name.clone().unwrap_or_else(|| "local".to_string()),
            tags: w.tags.clone(),
            team_id: w.team_id,
        })
        .unwrap_or_default();

    let resource_types = config
        .resource_types
        .iter()
        .map(|(name, dir)| (name.clone(), resolve_path(config_dir, dir)))
        .collect();

    Ok(ResolvedConfig {
        home,
        config_file: Some(config_path),
        streaming,
        tracing_enabled: config.tracing.map(|t| t.enabled).unwrap_or(false),
        worker,
        resource_types,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(contents: &str) -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(".buildstep");
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", contents).unwrap();

        (temp, config_path)
    }

    #[test]
    fn test_defaults_without_file() {
        let config = load_config_from(None).unwrap();

        assert!(config.config_file.is_none());
        assert_eq!(config.streaming, StreamingSettings::default());
        assert_eq!(config.worker.name, "local");
        assert!(!config.tracing_enabled);
        assert!(config.resource_types.is_empty());
    }

    #[test]
    fn test_config_file_parsing() {
        let (_temp, config_path) = write_config(
            r#"
version: "1.0"
paths:
  home: ./state
streaming:
  p2p_enabled: true
  p2p_timeout_seconds: 30
  compression: zstd
tracing:
  enabled: true
worker:
  name: laptop
  tags: [gpu]
resource_types:
  git: ./types/git
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        assert_eq!(file.version, "1.0");
        assert_eq!(file.paths.home, Some("./state".to_string()));
        assert_eq!(file.resource_types.get("git"), Some(&"./types/git".to_string()));

        let config = load_config_from(Some(config_path.clone())).unwrap();
        assert!(config.streaming.p2p_enabled);
        assert_eq!(config.streaming.compression, Compression::Zstd);
        assert_eq!(
            config.streaming_config().p2p_timeout,
            Duration::from_secs(30)
        );
        assert!(config.tracing_enabled);

        let worker = config.worker_info();
        assert_eq!(worker.name, "laptop");
        assert_eq!(worker.tags, vec!["gpu".to_string()]);
        assert_eq!(worker.resource_types, vec!["git".to_string()]);

        let config_dir = config_path.parent().unwrap();
        assert_eq!(config.resource_types["git"], config_dir.join("types/git"));
    }

    #[test]
    fn test_derived_paths() {
        let config = ResolvedConfig {
            home: PathBuf::from("/test/.buildstep"),
            config_file: None,
            streaming: StreamingSettings::default(),
            tracing_enabled: false,
            worker: WorkerSettings::default(),
            resource_types: HashMap::new(),
        };

        assert_eq!(config.caches_path(), PathBuf::from("/test/.buildstep/caches.jsonl"));
        assert_eq!(config.builds_dir(), PathBuf::from("/test/.buildstep/builds"));
        assert_eq!(config.volumes_dir(), PathBuf::from("/test/.buildstep/volumes"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project/.buildstep");

        assert_eq!(
            resolve_path(&base, "./types"),
            PathBuf::from("/home/user/project/.buildstep/types")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
