pub mod config;
pub mod entry;
pub mod health;
pub mod maintenance;
pub mod search;

pub use config::ConfigCommand;
pub use entry::{DeleteCommand, GetCommand, SetCommand};
pub use health::HealthCommand;
pub use maintenance::{CleanupCommand, FlushCommand};
pub use search::SearchCommand;
