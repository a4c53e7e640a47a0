//! Command-line interface for buildstep.
//!
//! Runs Get plans against the local worker and inspects the resource caches
//! and configuration they use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::warn;

use crate::config::{self, ResolvedConfig};
use crate::core::{FileResourceCacheFactory, RunState, StaticVariables};
use crate::domain::{
    resources_dir, ArtifactName, ContainerMetadata, ContainerType, GetPlan, PlanId, StepMetadata,
};
use crate::engine::{AllowAllPolicyChecker, DelegateFactory, FileBuild, NestedGetImageFetcher};
use crate::exec::{GetStep, Step, StepContext};
use crate::worker::{ArtifactWirer, FewestContainersStrategy, LocalClient, WorkerPool};

/// buildstep - Get-step runner for resource scripts
#[derive(Parser, Debug)]
#[command(name = "buildstep")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch a resource version as described by a plan file
    Get {
        /// Plan file (YAML)
        plan: PathBuf,

        /// Variable for ((var)) interpolation, as name=value (repeatable)
        #[arg(short, long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// List known resource caches
    Caches,

    /// Show resolved configuration (debug)
    Config,
}

/// A Get plan together with the build it runs for
#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub id: Option<PlanId>,

    #[serde(default)]
    pub metadata: StepMetadata,

    pub get: GetPlan,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Get { plan, vars } => run_get(&plan, vars).await,
            Commands::Caches => list_caches().await,
            Commands::Config => show_config(),
        }
    }
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{}'", s))
}

fn load_plan(path: &Path) -> Result<PlanFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse plan file: {}", path.display()))
}

/// Run one Get plan on the local worker
async fn run_get(plan_path: &Path, vars: Vec<(String, String)>) -> Result<()> {
    let cfg = config::config()?;
    let plan_file = load_plan(plan_path)?;
    let plan_id = plan_file.id.unwrap_or_else(|| PlanId::new("get"));
    let metadata = plan_file.metadata;
    let plan = plan_file.get;

    let mut variables = StaticVariables::new();
    for (name, value) in vars {
        variables.insert(name, value);
    }

    let pool = Arc::new(WorkerPool::new());
    pool.register_worker(cfg.worker_info());

    tokio::fs::create_dir_all(cfg.volumes_dir())
        .await
        .with_context(|| format!("Failed to create volumes directory: {}", cfg.volumes_dir().display()))?;
    let client = Arc::new(local_client(cfg, pool.clone()));

    let cache_factory = Arc::new(FileResourceCacheFactory::new(cfg.caches_path()));
    let strategy = Arc::new(FewestContainersStrategy);
    let wirer = ArtifactWirer::new(
        cfg.streaming.compression,
        pool.clone(),
        cfg.streaming_config(),
    );

    let image_fetcher = Arc::new(NestedGetImageFetcher::new(
        metadata.clone(),
        cache_factory.clone(),
        strategy.clone(),
        client.clone(),
        pool.clone(),
        wirer.clone(),
    ));

    let build = Arc::new(FileBuild::open(cfg.builds_dir(), metadata.build_id).await?);
    let delegates = DelegateFactory::new(
        build.clone(),
        plan_id.clone(),
        metadata.clone(),
        Arc::new(AllowAllPolicyChecker),
        wirer,
        image_fetcher,
    )
    .with_tracing(cfg.tracing_enabled);

    let container_metadata = ContainerMetadata {
        working_directory: resources_dir("get"),
        container_type: ContainerType::Get,
        step_name: plan.name.clone(),
        pipeline_id: metadata.pipeline_id,
    };
    let name = plan.name.clone();

    let step = GetStep::new(
        plan_id,
        plan,
        metadata,
        container_metadata,
        cache_factory,
        strategy,
        Arc::new(delegates),
        client,
        pool.clone(),
    );

    let ctx = StepContext::new();
    let cancel = ctx.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let state = RunState::new(Arc::new(variables));
    let succeeded = step.run(&ctx, &state).await?;

    if !succeeded {
        eprintln!("\n[Get '{}' failed; events in {}]", name, build.events_path().display());
        std::process::exit(1);
    }

    if let Some(artifact) = state.artifact_repository().artifact_for(&ArtifactName::new(name.clone())) {
        let volume = pool
            .volume(&artifact.id())
            .map(|v| v.path.display().to_string())
            .unwrap_or_else(|| artifact.id());
        println!("{}", volume);
    }
    eprintln!("\n[Get '{}' succeeded]", name);

    Ok(())
}

fn local_client(cfg: &ResolvedConfig, pool: Arc<WorkerPool>) -> LocalClient {
    cfg.resource_types
        .iter()
        .fold(LocalClient::new(pool, cfg.volumes_dir()), |client, (name, dir)| {
            client.with_resource_type(name.clone(), dir.clone())
        })
}

/// List resource caches recorded so far
async fn list_caches() -> Result<()> {
    let cfg = config::config()?;
    let factory = FileResourceCacheFactory::new(cfg.caches_path());
    let caches = factory.list().await?;

    if caches.is_empty() {
        println!("No resource caches found.");
        return Ok(());
    }

    println!("{:<6} {:<20} {:<20} {:<16} VERSION", "ID", "TYPE", "BASE TYPE", "KEY");
    println!("{}", "-".repeat(80));

    for cache in caches {
        let version = cache
            .version
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<20} {:<20} {:<16} {}",
            cache.id,
            cache.resource_type,
            cache.base_type,
            &cache.key[..cache.key.len().min(12)],
            version
        );
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("buildstep configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:    {}", cfg.home.display());
    println!("  Caches:  {}", cfg.caches_path().display());
    println!("  Builds:  {}", cfg.builds_dir().display());
    println!("  Volumes: {}", cfg.volumes_dir().display());
    println!();
    println!("Worker:");
    println!("  Name: {}", cfg.worker.name);
    println!("  Tags: {:?}", cfg.worker.tags);
    if let Some(team) = cfg.worker.team_id {
        println!("  Team: {}", team);
    }
    println!();
    println!("Resource types:");
    if cfg.resource_types.is_empty() {
        println!("  (none configured)");
    } else {
        let mut types: Vec<_> = cfg.resource_types.iter().collect();
        types.sort();
        for (name, dir) in types {
            println!("  {}: {}", name, dir.display());
        }
    }
    println!();
    println!("Streaming:");
    println!("  P2P enabled: {}", cfg.streaming.p2p_enabled);
    println!("  P2P timeout: {}s", cfg.streaming.p2p_timeout_seconds);
    println!("  Compression: {:?}", cfg.streaming.compression);
    println!();
    println!("Tracing enabled: {}", cfg.tracing_enabled);

    Ok(())
}
