//! Storage tier abstraction
//!
//! Every backing store implements [`TierStore`]. The manager only ever talks
//! to tiers through this trait; a tier never calls into another tier.
//!
//! Tiers store the expiry instant but do not hide expired entries on read.
//! Callers decide expiry with their own clock and physically remove expired
//! entries through [`TierStore::purge_expired`].

pub mod durable;
pub mod filter;
pub mod local;
pub mod registry;
pub mod shared;
pub mod similarity;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::types::{EntryKey, MemoryEntry, TierId};

pub use durable::DurableTier;
pub use filter::SearchFilter;
pub use local::LocalTier;
pub use registry::{TierRegistry, TierRegistryBuilder};
pub use shared::SharedTier;
pub use similarity::SimilarityTier;

/// Eviction policy applied by a bounded tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used
    #[default]
    Lru,
    /// Least frequently used, ties broken by recency
    Lfu,
    /// Never evict; writes to a full tier fail with `CapacityExceeded`
    None,
}

/// How writes reach the tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Acknowledged only once the tier confirms
    WriteThrough,
    /// Acknowledged before the tier confirms, durable within `max_staleness`
    WriteBehind { max_staleness: Duration },
}

/// Capacity bound; `None` fields are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub max_entries: Option<u64>,
    pub max_bytes: Option<u64>,
}

impl Capacity {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn entries(max_entries: u64) -> Self {
        Self {
            max_entries: Some(max_entries),
            max_bytes: None,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    pub fn is_bounded(&self) -> bool {
        self.max_entries.is_some() || self.max_bytes.is_some()
    }

    /// Fraction of the bound in use (0.0 when unbounded, may exceed 1.0)
    pub fn pressure(&self, stats: &TierStats) -> f64 {
        let by_entries = self
            .max_entries
            .filter(|m| *m > 0)
            .map_or(0.0, |m| stats.entries as f64 / m as f64);
        let by_bytes = self
            .max_bytes
            .filter(|m| *m > 0)
            .map_or(0.0, |m| stats.bytes as f64 / m as f64);
        by_entries.max(by_bytes)
    }

    /// True when adding one more entry would exceed the entry bound
    pub fn is_full(&self, stats: &TierStats) -> bool {
        self.max_entries.is_some_and(|m| stats.entries >= m)
            || self.max_bytes.is_some_and(|m| stats.bytes >= m)
    }
}

/// Static configuration of one tier
#[derive(Debug, Clone)]
pub struct TierDescriptor {
    pub id: TierId,
    /// Lower is faster
    pub ordinal: u8,
    pub capacity: Capacity,
    pub eviction: EvictionPolicy,
    pub write_mode: WriteMode,
    /// Per-call deadline for this tier
    pub timeout: Duration,
    /// Accesses per telemetry window needed to be promoted into this tier
    pub promote_threshold: f64,
    /// Accesses per window below which a copy starts cooling down
    pub retain_threshold: f64,
    /// How long a key must stay below `retain_threshold` before demotion
    pub cooldown: Duration,
}

impl TierDescriptor {
    pub fn new(id: TierId) -> Self {
        let ordinal = match id {
            TierId::L1 => 0,
            TierId::L2 => 1,
            TierId::L3 => 2,
            TierId::L4 => 3,
        };
        Self {
            id,
            ordinal,
            capacity: Capacity::unbounded(),
            eviction: EvictionPolicy::Lru,
            write_mode: WriteMode::WriteThrough,
            timeout: Duration::from_millis(500),
            promote_threshold: 0.0,
            retain_threshold: 0.0,
            cooldown: Duration::from_secs(60),
        }
    }

    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_thresholds(mut self, promote: f64, retain: f64) -> Self {
        self.promote_threshold = promote;
        self.retain_threshold = retain;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn is_write_behind(&self) -> bool {
        matches!(self.write_mode, WriteMode::WriteBehind { .. })
    }
}

/// Size snapshot reported by a tier; may be stale
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    pub entries: u64,
    pub bytes: u64,
    /// Entries evicted by the tier's own capacity manager since start
    pub evictions: u64,
}

/// Request passed to a tier's own eviction hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionHint {
    pub max_keys: usize,
    pub policy: EvictionPolicy,
}

/// A search hit from the similarity tier
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    /// Distance from the query vector; lower is closer
    pub distance: f32,
}

/// Capability contract every storage tier implements
#[async_trait]
pub trait TierStore: Send + Sync {
    fn descriptor(&self) -> &TierDescriptor;

    fn id(&self) -> TierId {
        self.descriptor().id
    }

    /// Fetch an entry; `Ok(None)` is a normal miss
    async fn get(&self, key: &EntryKey) -> Result<Option<MemoryEntry>>;

    /// Store an entry, rejecting writes older than the stored sequence
    async fn set(&self, entry: &MemoryEntry) -> Result<()>;

    /// Remove an entry; returns whether it was present
    async fn delete(&self, key: &EntryKey) -> Result<bool>;

    async fn exists(&self, key: &EntryKey) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn approximate_size(&self) -> Result<TierStats>;

    /// Evict up to `hint.max_keys` entries chosen by the tier's own policy
    async fn evict(&self, hint: EvictionHint) -> Result<Vec<EntryKey>>;

    /// Physically remove up to `limit` entries expired at `now`
    async fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EntryKey>>;

    /// Store several entries; results line up with the input
    async fn set_many(&self, entries: &[MemoryEntry]) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(self.set(entry).await);
        }
        results
    }
}

/// Tiers that answer nearest-neighbour queries
#[async_trait]
pub trait SimilarityStore: TierStore {
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>>;
}

/// Stale-write check shared by the tier implementations
pub(crate) fn check_sequence(
    key: &EntryKey,
    stored: Option<u64>,
    attempted: u64,
) -> Result<()> {
    match stored {
        Some(stored) if attempted < stored => Err(crate::error::MemoryError::StaleWriteRejected {
            key: key.to_string(),
            stored,
            attempted,
        }),
        _ => Ok(()),
    }
}
