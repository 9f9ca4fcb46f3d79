use std::path::Path;

use clap::{Parser, Subcommand};
use tiermem::Config;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct ConfigCommand {
    #[clap(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    #[clap(about = "Print the effective configuration")]
    Show,

    #[clap(about = "Validate the configuration without opening any tier")]
    Check,
}

impl ConfigCommand {
    pub async fn execute(&self, config_path: Option<&Path>, format: OutputFormat) -> CliResult<()> {
        let config = Config::load(config_path)?;
        match &self.command {
            ConfigSubcommand::Show => Self::show(&config, format),
            ConfigSubcommand::Check => Self::check(&config, format),
        }
    }

    fn show(config: &Config, format: OutputFormat) -> CliResult<()> {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
            OutputFormat::Table => println!("{}", toml::to_string_pretty(config)?),
        }
        Ok(())
    }

    fn check(config: &Config, format: OutputFormat) -> CliResult<()> {
        let result = config.validate();
        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "valid": result.is_ok(),
                    "error": result.as_ref().err().map(ToString::to_string),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if result.is_ok() {
                    println!("Configuration is valid.");
                    println!("Data directory: {}", config.data_dir.display());
                }
            }
        }
        result?;
        Ok(())
    }
}
