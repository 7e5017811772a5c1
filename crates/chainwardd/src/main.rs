//! chainwardd: the chainward daemon.
//!
//! Single binary that assembles every chainward subsystem:
//! - State store (redb)
//! - Container runtime connection (Docker-compatible API)
//! - Node lifecycle manager + per-node supervisors
//! - Alert manager
//! - Health monitor
//! - Pruning scheduler
//!
//! # Usage
//!
//! ```text
//! chainwardd run --config /etc/chainward/chainward.toml
//! chainwardd check --chain bitcoin --mode pruned
//! chainwardd endpoints
//! ```

mod daemon;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use chainward_core::{ChainwardConfig, NodeMode, StaticCatalog};
use chainward_placement::{ResourceGate, SysinfoProbe};
use chainward_runtime::ConnectionResolver;

const DEFAULT_FILTER: &str = "info,chainward=debug";

#[derive(Parser)]
#[command(name = "chainwardd", about = "Chainward blockchain node supervisor")]
struct Cli {
    /// Path to chainward.toml. Missing sections use defaults.
    #[arg(long, short, global = true, default_value = "/etc/chainward/chainward.toml")]
    config: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor until interrupted.
    Run,

    /// Check whether this host can run a blockchain in a given mode.
    Check {
        #[arg(long)]
        chain: String,

        /// full, pruned or light.
        #[arg(long)]
        mode: String,
    },

    /// List the container runtime endpoints that would be tried, in order.
    Endpoints,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Run => daemon::run(config).await,
        Command::Check { chain, mode } => check(&config, &chain, &mode),
        Command::Endpoints => endpoints(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<ChainwardConfig> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(ChainwardConfig::default());
    }
    ChainwardConfig::from_file(path).with_context(|| format!("load config {}", path.display()))
}

fn check(config: &ChainwardConfig, chain: &str, mode: &str) -> anyhow::Result<()> {
    let mode: NodeMode = mode.parse()?;
    let catalog = StaticCatalog::from_file(&config.daemon.catalog)
        .with_context(|| format!("load catalog {}", config.daemon.catalog.display()))?;
    let gate = ResourceGate::new(
        Arc::new(catalog),
        Arc::new(SysinfoProbe::new()),
        config.daemon.data_root.clone(),
    );

    let verdict = gate.can_run(chain, mode);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if !verdict.can_run {
        anyhow::bail!(
            "{chain} ({mode}) cannot run here: {}",
            verdict.reason.as_deref().unwrap_or("unknown reason")
        );
    }
    Ok(())
}

fn endpoints(config: &ChainwardConfig) -> anyhow::Result<()> {
    let resolver = ConnectionResolver::from_config(&config.runtime)?;
    for endpoint in resolver.candidates() {
        println!("{endpoint}");
    }
    Ok(())
}
