use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use tiermem::UnifiedMemoryManager;

use crate::args::resolve_key;
use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct FlushCommand {
    #[clap(help = "Flush only this key. Defaults to every buffered write.")]
    pub key: Option<String>,
}

#[derive(Parser)]
pub struct CleanupCommand {}

impl FlushCommand {
    pub async fn execute(
        &self,
        manager: &UnifiedMemoryManager,
        namespace: Option<&str>,
        format: OutputFormat,
    ) -> CliResult<()> {
        match &self.key {
            Some(key) => {
                let key = resolve_key(manager, namespace, key);
                manager.flush(&key).await?;
                match format {
                    OutputFormat::Json => {
                        let output = serde_json::json!({
                            "key": key.to_string(),
                            "flushed": true,
                        });
                        println!("{}", serde_json::to_string_pretty(&output)?);
                    }
                    OutputFormat::Table => println!("Entry {key} is durable."),
                }
            }
            None => {
                let flushed = manager.flush_all().await?;
                match format {
                    OutputFormat::Json => {
                        let output = serde_json::json!({ "flushed": flushed });
                        println!("{}", serde_json::to_string_pretty(&output)?);
                    }
                    OutputFormat::Table => println!("Flushed {flushed} buffered writes."),
                }
            }
        }
        Ok(())
    }
}

impl CleanupCommand {
    pub async fn execute(&self, manager: &UnifiedMemoryManager, format: OutputFormat) -> CliResult<()> {
        let report = manager.cleanup_expired().await?;

        match format {
            OutputFormat::Json => {
                let purged: serde_json::Map<String, serde_json::Value> = report
                    .purged
                    .iter()
                    .map(|(tier, count)| (tier.as_str().to_string(), (*count).into()))
                    .collect();
                let output = serde_json::json!({
                    "purged": purged,
                    "failed": report.failed.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
                    "completed": report.completed,
                    "total": report.total(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Expiry Sweep");
                println!("============\n");

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Tier", "Purged", "Status"]);

                for tier in manager.registry().ids() {
                    let status = if report.failed.contains(&tier) { "failed" } else { "ok" };
                    table.add_row([
                        tier.as_str().to_uppercase(),
                        report.purged.get(&tier).copied().unwrap_or_default().to_string(),
                        status.to_string(),
                    ]);
                }

                println!("{table}\n");
                println!("Total: {} expired entries purged", report.total());
                if !report.completed {
                    println!("Sweep stopped early; remaining entries are purged on the next run.");
                }
            }
        }

        Ok(())
    }
}
