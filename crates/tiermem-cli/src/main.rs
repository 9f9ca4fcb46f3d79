use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tiermem::{Config, UnifiedMemoryManager};
use tiermem_cli::commands::{
    CleanupCommand, ConfigCommand, DeleteCommand, FlushCommand, GetCommand, HealthCommand,
    SearchCommand, SetCommand,
};
use tiermem_cli::error::CliResult;
use tiermem_cli::output::OutputFormat;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tiermem-cli")]
#[command(about = "tiermem CLI - Operator tool for the multi-tier memory manager")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(long, short = 'n', global = true, help = "Namespace for keys (defaults to the configured one)")]
    pub namespace: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Probe every tier and show counters")]
    Health(HealthCommand),

    #[clap(about = "Read an entry")]
    Get(GetCommand),

    #[clap(about = "Write an entry")]
    Set(SetCommand),

    #[clap(about = "Delete an entry from every tier")]
    Delete(DeleteCommand),

    #[clap(about = "Similarity search over searchable entries")]
    Search(SearchCommand),

    #[clap(about = "Make buffered writes durable")]
    Flush(FlushCommand),

    #[clap(about = "Purge expired entries from every tier")]
    Cleanup(CleanupCommand),

    #[clap(about = "Configuration commands")]
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    init_logging();

    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    if let Command::Config(cmd) = &cli.command {
        return cmd.execute(cli.config.as_deref(), format).await;
    }

    let config = Config::load(cli.config.as_deref())?;
    let manager = UnifiedMemoryManager::from_config(&config).await?;
    let namespace = cli.namespace.as_deref();

    let result = match &cli.command {
        Command::Health(cmd) => cmd.execute(&manager, format).await,
        Command::Get(cmd) => cmd.execute(&manager, namespace, format).await,
        Command::Set(cmd) => cmd.execute(&manager, namespace, format).await,
        Command::Delete(cmd) => cmd.execute(&manager, namespace, format).await,
        Command::Search(cmd) => {
            cmd.execute(&manager, namespace.unwrap_or(&config.namespace), format)
                .await
        }
        Command::Flush(cmd) => cmd.execute(&manager, namespace, format).await,
        Command::Cleanup(cmd) => cmd.execute(&manager, format).await,
        Command::Config(_) => Ok(()),
    };

    // buffered writes must reach the durable tier before the process exits
    manager.shutdown().await?;
    result
}

/// Logs go to stderr so `--json` output stays parseable
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
