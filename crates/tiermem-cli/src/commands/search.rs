use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use tiermem::{SearchFilter, UnifiedMemoryManager};

use crate::args::{parse_tag, parse_vector};
use crate::commands::entry::{entry_json, format_metadata};
use crate::error::CliResult;
use crate::output::{OutputFormat, truncate_string};

#[derive(Parser)]
pub struct SearchCommand {
    #[clap(help = "Query vector as comma-separated floats")]
    pub vector: String,

    #[clap(long, short, default_value = "10", help = "Maximum number of results")]
    pub k: usize,

    #[clap(long = "tag", short = 't', value_parser = parse_tag, help = "Only entries carrying this tag (repeatable)")]
    pub tags: Vec<(String, String)>,

    #[clap(long, help = "Drop results farther than this distance")]
    pub max_distance: Option<f32>,

    #[clap(long, help = "Search every namespace instead of the selected one")]
    pub all_namespaces: bool,
}

impl SearchCommand {
    fn filter(&self, namespace: &str) -> SearchFilter {
        let mut filter = SearchFilter::new();
        if !self.all_namespaces {
            filter = filter.with_namespace(namespace);
        }
        for (key, value) in &self.tags {
            filter = filter.with_tag(key, value);
        }
        if let Some(max) = self.max_distance {
            filter = filter.with_max_distance(max);
        }
        filter
    }

    pub async fn execute(
        &self,
        manager: &UnifiedMemoryManager,
        namespace: &str,
        format: OutputFormat,
    ) -> CliResult<()> {
        let query = parse_vector(&self.vector)?;
        let hits = manager.search(&query, self.k, &self.filter(namespace)).await?;

        match format {
            OutputFormat::Json => {
                let output: Vec<_> = hits
                    .iter()
                    .map(|hit| {
                        serde_json::json!({
                            "distance": hit.distance,
                            "entry": entry_json(&hit.entry),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if hits.is_empty() {
                    println!("No matching entries.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Key", "Distance", "Value", "Metadata"]);

                for hit in &hits {
                    table.add_row([
                        hit.entry.key.to_string(),
                        format!("{:.4}", hit.distance),
                        truncate_string(&String::from_utf8_lossy(&hit.entry.value), 50),
                        format_metadata(&hit.entry.metadata),
                    ]);
                }

                println!("{table}");
                println!("\nTotal: {} results", hits.len());
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[clap(flatten)]
        search: SearchCommand,
    }

    fn parse(args: &[&str]) -> SearchCommand {
        let mut argv = vec!["search"];
        argv.extend_from_slice(args);
        Harness::parse_from(argv).search
    }

    #[test]
    fn test_filter_scoped_to_namespace_by_default() {
        let cmd = parse(&["1,0", "-t", "source=chat", "--max-distance", "0.5"]);
        let filter = cmd.filter("notes");
        assert_eq!(filter.namespace.as_deref(), Some("notes"));
        assert_eq!(filter.metadata.get("source").map(String::as_str), Some("chat"));
        assert_eq!(filter.max_distance, Some(0.5));
    }

    #[test]
    fn test_all_namespaces_drops_scope() {
        let cmd = parse(&["1,0", "--all-namespaces"]);
        assert!(cmd.filter("notes").namespace.is_none());
        assert_eq!(cmd.k, 10);
    }
}
