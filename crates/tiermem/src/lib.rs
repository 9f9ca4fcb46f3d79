//! tiermem - Unified multi-tier memory manager
//!
//! One read/write/search interface over an in-process cache (L1), an
//! optional shared cache (L2), a durable store (L3) and a vector store (L4).
//! Entries move between tiers according to their access pattern; the
//! durable tier stays authoritative.

pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod placement;
pub mod server;
pub mod testing;
pub mod tier;

pub use config::Config;
pub use error::{MemoryError, Result};
pub use manager::{
    CleanupReport, HealthReport, OpOutcome, Operation, SetOptions, UnifiedMemoryManager, WriteAck,
};
pub use memory::{Durability, EntryKey, MemoryEntry, Metadata, TierId};
pub use tier::SearchFilter;
