//! sporemesh - workload-orchestration mesh.
//!
//! Builds signed spores, publishes them into a content-addressed
//! repository, and runs the mesh (fabric + edge gateway + node agents).

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// sporemesh - workload-orchestration mesh
#[derive(Parser, Debug)]
#[command(name = "sporemesh")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pack a binary and a manifest into a signed spore
    Build {
        /// Path to the executable to pack
        #[arg(long)]
        binary: PathBuf,

        /// Path to the manifest JSON file
        #[arg(long)]
        manifest: PathBuf,

        /// Path to an Ed25519 signing-key file (generated under --out when
        /// omitted)
        #[arg(long)]
        key: Option<PathBuf>,

        /// Output directory for the spore and a generated key
        #[arg(long, default_value = "./out")]
        out: PathBuf,
    },

    /// Verify a spore and store it in the repository
    Publish {
        /// Path to the spore file
        #[arg(long)]
        spore: PathBuf,

        /// Repository directory
        #[arg(long, default_value = "./repo")]
        repo: PathBuf,
    },

    /// Run fabric, edge gateway, and agents; publish an initial plan
    Run(commands::run::RunArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Build {
            binary,
            manifest,
            key,
            out,
        } => commands::build::run(&binary, &manifest, key.as_deref(), &out),
        Commands::Publish { spore, repo } => commands::publish::run(&spore, &repo),
        Commands::Run(args) => commands::run::run(args),
    }
}
