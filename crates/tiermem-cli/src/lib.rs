pub mod args;
pub mod commands;
pub mod error;
pub mod output;

pub use commands::{
    CleanupCommand, ConfigCommand, DeleteCommand, FlushCommand, GetCommand, HealthCommand,
    SearchCommand, SetCommand,
};
pub use error::{CliError, CliResult};
pub use output::{OutputFormat, format_size, format_timestamp, truncate_string};
