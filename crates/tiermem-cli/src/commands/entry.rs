use chrono::{TimeDelta, Utc};
use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use tiermem::{Durability, MemoryEntry, Metadata, SetOptions, UnifiedMemoryManager};

use crate::args::{parse_tag, parse_vector, resolve_key};
use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, truncate_string};

#[derive(Parser)]
pub struct GetCommand {
    #[clap(help = "Entry key")]
    pub key: String,

    #[clap(long, help = "Print only the raw value")]
    pub raw: bool,
}

#[derive(Parser)]
pub struct SetCommand {
    #[clap(help = "Entry key")]
    pub key: String,

    #[clap(help = "Value to store")]
    pub value: String,

    #[clap(long = "tag", short = 't', value_parser = parse_tag, help = "Metadata tag as key=value (repeatable)")]
    pub tags: Vec<(String, String)>,

    #[clap(long, help = "Expire the entry after this many seconds")]
    pub ttl_secs: Option<i64>,

    #[clap(long, help = "Embedding as comma-separated floats")]
    pub embedding: Option<String>,

    #[clap(long, help = "Tag the entry searchable (requires --embedding)")]
    pub searchable: bool,

    #[clap(long, help = "Allow the durable tier to evict this entry")]
    pub ephemeral: bool,

    #[clap(long, help = "Explicit write sequence")]
    pub sequence: Option<u64>,
}

#[derive(Parser)]
pub struct DeleteCommand {
    #[clap(help = "Entry key to delete")]
    pub key: String,
}

impl GetCommand {
    pub async fn execute(
        &self,
        manager: &UnifiedMemoryManager,
        namespace: Option<&str>,
        format: OutputFormat,
    ) -> CliResult<()> {
        let key = resolve_key(manager, namespace, &self.key);
        let entry = manager
            .get(&key)
            .await?
            .ok_or_else(|| format!("Entry not found: {key}"))?;

        if self.raw {
            println!("{}", String::from_utf8_lossy(&entry.value));
            return Ok(());
        }

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&entry_json(&entry))?);
            }
            OutputFormat::Table => {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Property", "Value"]);

                table.add_row(["Key", &entry.key.to_string()]);
                table.add_row(["Value", &truncate_string(&String::from_utf8_lossy(&entry.value), 80)]);
                table.add_row(["Size", &entry.value.len().to_string()]);
                table.add_row(["Sequence", &entry.sequence.to_string()]);
                table.add_row(["Durability", entry.durability.as_str()]);
                table.add_row(["Created", &format_timestamp(&entry.created_at)]);
                table.add_row(["Last Accessed", &format_timestamp(&entry.last_accessed_at)]);
                table.add_row(["Access Count", &entry.access_count.to_string()]);
                table.add_row([
                    "Expires",
                    &entry.ttl.as_ref().map_or_else(|| "never".to_string(), format_timestamp),
                ]);
                table.add_row(["Metadata", &format_metadata(&entry.metadata)]);
                table.add_row([
                    "Embedding",
                    &entry
                        .embedding
                        .as_ref()
                        .map_or_else(|| "-".to_string(), |e| format!("{} dims", e.len())),
                ]);

                println!("{table}");
            }
        }

        Ok(())
    }
}

impl SetCommand {
    fn options(&self) -> CliResult<SetOptions> {
        let mut options = SetOptions::new();
        for (key, value) in &self.tags {
            options = options.with_tag(key, value);
        }
        if let Some(secs) = self.ttl_secs {
            if secs <= 0 {
                return Err("--ttl-secs must be positive".into());
            }
            let expires_at = TimeDelta::try_seconds(secs)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
                .ok_or_else(|| format!("--ttl-secs {secs} is out of range"))?;
            options = options.with_ttl(expires_at);
        }
        if let Some(embedding) = &self.embedding {
            options = options.with_embedding(parse_vector(embedding)?);
        }
        if self.searchable {
            if self.embedding.is_none() {
                return Err("--searchable requires --embedding".into());
            }
            options = options.with_tag(tiermem::memory::SEARCHABLE_TAG, "true");
        }
        if self.ephemeral {
            options = options.with_durability(Durability::Ephemeral);
        }
        if let Some(sequence) = self.sequence {
            options = options.with_sequence(sequence);
        }
        Ok(options)
    }

    pub async fn execute(
        &self,
        manager: &UnifiedMemoryManager,
        namespace: Option<&str>,
        format: OutputFormat,
    ) -> CliResult<()> {
        let key = resolve_key(manager, namespace, &self.key);
        let ack = manager
            .set(&key, self.value.clone().into_bytes(), self.options()?)
            .await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "key": key.to_string(),
                    "sequence": ack.sequence,
                    "durable": ack.durable,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Stored {key} at sequence {}.", ack.sequence);
                if !ack.durable {
                    println!("Write is buffered; it becomes durable on the next flush.");
                }
            }
        }

        Ok(())
    }
}

impl DeleteCommand {
    pub async fn execute(
        &self,
        manager: &UnifiedMemoryManager,
        namespace: Option<&str>,
        format: OutputFormat,
    ) -> CliResult<()> {
        let key = resolve_key(manager, namespace, &self.key);
        let deleted = manager.delete(&key).await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "key": key.to_string(),
                    "deleted": deleted,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if deleted {
                    println!("Entry {key} deleted successfully.");
                } else {
                    println!("Entry {key} not found.");
                }
            }
        }

        Ok(())
    }
}

pub(crate) fn entry_json(entry: &MemoryEntry) -> serde_json::Value {
    serde_json::json!({
        "key": entry.key.to_string(),
        "value": String::from_utf8_lossy(&entry.value),
        "sequence": entry.sequence,
        "durability": entry.durability.as_str(),
        "created_at": entry.created_at.to_rfc3339(),
        "last_accessed_at": entry.last_accessed_at.to_rfc3339(),
        "access_count": entry.access_count,
        "expires_at": entry.ttl.map(|t| t.to_rfc3339()),
        "metadata": entry.metadata,
        "embedding_size": entry.embedding.as_ref().map(Vec::len),
    })
}

pub(crate) fn format_metadata(metadata: &Metadata) -> String {
    if metadata.is_empty() {
        return "-".to_string();
    }
    metadata
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[clap(flatten)]
        set: SetCommand,
    }

    fn parse(args: &[&str]) -> SetCommand {
        let mut argv = vec!["set"];
        argv.extend_from_slice(args);
        Harness::parse_from(argv).set
    }

    #[test]
    fn test_set_options_from_flags() {
        let cmd = parse(&[
            "k", "v", "-t", "source=chat", "--embedding", "1,0", "--searchable", "--ephemeral",
            "--sequence", "9",
        ]);
        let options = cmd.options().unwrap();
        assert_eq!(options.metadata.get("source").map(String::as_str), Some("chat"));
        assert_eq!(options.metadata.get("searchable").map(String::as_str), Some("true"));
        assert_eq!(options.embedding, Some(vec![1.0, 0.0]));
        assert_eq!(options.durability, Durability::Ephemeral);
        assert_eq!(options.sequence, Some(9));
    }

    #[test]
    fn test_searchable_needs_embedding() {
        assert!(parse(&["k", "v", "--searchable"]).options().is_err());
    }

    #[test]
    fn test_ttl_must_be_positive() {
        assert!(parse(&["k", "v", "--ttl-secs", "0"]).options().is_err());
        let options = parse(&["k", "v", "--ttl-secs", "60"]).options().unwrap();
        assert!(options.ttl.is_some_and(|t| t > Utc::now()));
    }

    #[test]
    fn test_huge_ttl_is_an_error() {
        let huge = i64::MAX.to_string();
        let err = parse(&["k", "v", "--ttl-secs", huge.as_str()])
            .options()
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_format_metadata() {
        let mut metadata = Metadata::new();
        assert_eq!(format_metadata(&metadata), "-");
        metadata.insert("a".to_string(), "1".to_string());
        metadata.insert("b".to_string(), "2".to_string());
        assert_eq!(format_metadata(&metadata), "a=1, b=2");
    }
}
