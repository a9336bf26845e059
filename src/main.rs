// kiro-gateway: OpenAI-compatible HTTP front for persistent kiro agent
// subprocesses. Thin CLI wiring; the core lives in the library.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use kiro_gateway::{server, GatewayConfig, RouteTable};

#[derive(Debug, Parser)]
#[command(
    name = "kiro-gateway",
    version,
    about = "OpenAI-compatible gateway for persistent kiro agent sessions"
)]
struct Cli {
    /// Interface to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind
    #[arg(long, default_value_t = 8787)]
    port: u16,

    /// Path to the kiro binary
    #[arg(long, default_value = "kiro")]
    kiro_bin: PathBuf,

    /// Extra argument passed to the agent after the subcommand (repeatable)
    #[arg(long = "kiro-args")]
    kiro_args: Vec<String>,

    /// Default working directory for spawned agents
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Evict a session after this many idle seconds
    #[arg(long, default_value_t = 1800)]
    idle_secs: u64,

    /// JSON route table mapping Discord channel ids to overrides
    #[arg(long)]
    routes: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let cwd = match cli.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir()?,
    };

    let config = GatewayConfig {
        host: cli.host,
        port: cli.port,
        kiro_bin: cli.kiro_bin,
        kiro_args: cli.kiro_args,
        cwd,
        idle_timeout: std::time::Duration::from_secs(cli.idle_secs),
        ..Default::default()
    };

    let routes = match &cli.routes {
        Some(path) => RouteTable::load(path)?,
        None => RouteTable::empty(),
    };

    server::run(config, routes).await
}
