use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use tiermem::UnifiedMemoryManager;
use tiermem::manager::TierStatus;

use crate::error::CliResult;
use crate::output::{OutputFormat, format_size, or_dash};

#[derive(Parser)]
pub struct HealthCommand {
    #[clap(long, help = "Exit with an error when the durable tier is unreachable")]
    pub strict: bool,
}

impl HealthCommand {
    pub async fn execute(&self, manager: &UnifiedMemoryManager, format: OutputFormat) -> CliResult<()> {
        let report = manager.health().await;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Table => {
                println!("tiermem Health");
                println!("==============\n");

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header([
                        "Tier", "Role", "Status", "Probe", "Entries", "Size", "Hits", "Misses",
                        "p95",
                    ]);

                for tier in &report.tiers {
                    let metrics = report.metrics.tier(tier.tier);
                    let status = match tier.status {
                        TierStatus::Up => "up".to_string(),
                        TierStatus::Unavailable => format!(
                            "unavailable ({})",
                            tier.error.as_deref().unwrap_or("no reason")
                        ),
                    };
                    table.add_row([
                        tier.tier.as_str().to_uppercase(),
                        tier.role.clone(),
                        status,
                        format!("{}ms", tier.probe_ms),
                        or_dash(tier.entries),
                        or_dash(tier.bytes.map(format_size)),
                        or_dash(metrics.map(|m| m.hits)),
                        or_dash(metrics.map(|m| m.misses)),
                        or_dash(metrics.map(|m| format!("{}us", m.p95_us))),
                    ]);
                }

                println!("{table}\n");

                println!("Placement model: {}", report.placement_model);
                println!(
                    "Pending: {} repairs, {} buffered writes, {} tombstones",
                    report.repairs_pending, report.write_behind_pending, report.tombstones
                );
                println!(
                    "Overall: {}",
                    if report.healthy { "healthy" } else { "durable tier unreachable" }
                );
            }
        }

        if self.strict && !report.healthy {
            return Err("Durable tier is unreachable".into());
        }
        Ok(())
    }
}
