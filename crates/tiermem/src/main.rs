//! tiermem-cache - shared cache daemon serving the L2 tier over HTTP

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tiermem::config::Config;
use tiermem::error::Result;
use tiermem::server::CacheServer;

/// Shared cache daemon for tiermem managers
#[derive(Parser)]
#[command(name = "tiermem-cache")]
#[command(about = "Shared L2 cache daemon for tiermem")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Override the listen address from the config file
    #[arg(long, global = true)]
    pub listen: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the cache server (default command)
    #[command(name = "serve")]
    Serve,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config, cli.listen).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tiermem=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    tracing::info!("Starting tiermem-cache");

    let mut config = Config::load(config_path.as_deref())?;
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
    }
    tracing::debug!("Server config: {:?}", config.server);

    CacheServer::new(config.server).serve().await?;

    tracing::info!("tiermem-cache stopped");
    Ok(())
}
