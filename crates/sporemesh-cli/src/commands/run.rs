//! `sporemesh run` - run fabric, edge, and agents in one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sporemesh_core::agent::{Agent, AgentConfig};
use sporemesh_core::config::MeshConfig;
use sporemesh_core::edge::Edge;
use sporemesh_core::fabric::{Budget, Fabric, Plan};
use sporemesh_core::repo::Repository;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Arguments of the `run` subcommand. Flags override config-file values,
/// which override compiled defaults.
#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// App name of the initial plan
    #[arg(long)]
    pub app: String,

    /// Repository digest of the bundle to deploy
    #[arg(long)]
    pub digest: String,

    /// Optional TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Repository directory
    #[arg(long)]
    pub repo: Option<PathBuf>,

    /// Root directory for agent run directories
    #[arg(long)]
    pub run_dir: Option<PathBuf>,

    /// Edge gateway listen address
    #[arg(long)]
    pub edge: Option<SocketAddr>,

    /// Number of agent nodes
    #[arg(long)]
    pub nodes: Option<u32>,

    /// Instances per plan
    #[arg(long)]
    pub instances: Option<u32>,

    /// Blue/green warmup, e.g. "2s"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub warmup: Option<Duration>,
}

pub fn run(args: RunArgs) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(run_mesh(args))
}

async fn run_mesh(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => MeshConfig::default(),
    };
    if let Some(repo) = args.repo {
        config.repo_dir = repo;
    }
    if let Some(run_dir) = args.run_dir {
        config.run_dir = run_dir;
    }
    if let Some(edge) = args.edge {
        config.edge_addr = edge;
    }
    if let Some(nodes) = args.nodes {
        config.nodes = nodes;
    }
    if let Some(instances) = args.instances {
        config.instances = instances;
    }
    if let Some(warmup) = args.warmup {
        config.warmup = warmup;
    }

    let repo = Arc::new(
        Repository::open(&config.repo_dir)
            .with_context(|| format!("failed to open repository {}", config.repo_dir.display()))?,
    );
    let fabric = Arc::new(Fabric::new());
    fabric.set_budget(Budget {
        app: args.app.clone(),
        max_instances: config.instances * config.nodes,
        cpu_milli: 1000,
        memory_mb: 512,
    });

    let cancel = CancellationToken::new();

    let edge = Arc::new(Edge::new(Arc::clone(&fabric)));
    let edge_task = tokio::spawn(Arc::clone(&edge).serve(config.edge_addr, cancel.clone()));

    let mut agent_tasks = Vec::new();
    for i in 1..=config.nodes {
        let id = format!("node-{i}");
        let mut agent_config = AgentConfig::new(config.run_dir.join(&id));
        agent_config.warmup = config.warmup;
        let agent = Agent::new(id, Arc::clone(&fabric), Arc::clone(&repo), agent_config);
        agent_tasks.push(tokio::spawn(agent.run(cancel.clone())));
    }

    fabric.publish_plan(Plan {
        app: args.app.clone(),
        digest: args.digest.clone(),
        min: config.instances,
        max: config.instances * config.nodes,
        port: 0,
    });

    info!(
        app = %args.app,
        nodes = config.nodes,
        "mesh running; try: curl http://{}/{}/hello",
        config.edge_addr,
        args.app
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for interrupt")?;
    info!("shutting down");
    cancel.cancel();

    for task in agent_tasks {
        let _ = task.await;
    }
    match edge_task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(%error, "edge gateway exited with error"),
        Err(error) => warn!(%error, "edge gateway task failed"),
    }
    Ok(())
}
