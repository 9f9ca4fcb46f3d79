//! Entry types for the tiermem system
//!
//! Defines the unit of storage (`MemoryEntry`), its namespaced key, and the
//! tier identifiers and bitmask used to record physical placement.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace used when a caller supplies a bare key
pub const DEFAULT_NAMESPACE: &str = "default";

/// Metadata tag marking an entry as eligible for the similarity tier
pub const SEARCHABLE_TAG: &str = "searchable";

/// Ordered key/value tags attached to an entry; does not affect identity
pub type Metadata = BTreeMap<String, String>;

/// Identifier of an entry: unique within its namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    /// Logical namespace (user or session scope)
    pub namespace: String,
    /// Opaque key within the namespace
    pub key: String,
}

impl EntryKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

impl From<&str> for EntryKey {
    fn from(key: &str) -> Self {
        Self::new(DEFAULT_NAMESPACE, key)
    }
}

impl From<String> for EntryKey {
    fn from(key: String) -> Self {
        Self::new(DEFAULT_NAMESPACE, key)
    }
}

impl From<(&str, &str)> for EntryKey {
    fn from((namespace, key): (&str, &str)) -> Self {
        Self::new(namespace, key)
    }
}

impl From<&EntryKey> for EntryKey {
    fn from(key: &EntryKey) -> Self {
        key.clone()
    }
}

/// Storage tier identifier, ordered fastest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierId {
    /// In-process bounded cache
    L1,
    /// Shared network cache
    L2,
    /// Durable relational store (authoritative)
    L3,
    /// Vector similarity store
    L4,
}

impl TierId {
    /// All tiers in ascending latency order
    pub const ALL: [TierId; 4] = [TierId::L1, TierId::L2, TierId::L3, TierId::L4];

    /// Bit used for this tier in a `TierMask`
    pub fn bit(self) -> u8 {
        match self {
            TierId::L1 => 0b0001,
            TierId::L2 => 0b0010,
            TierId::L3 => 0b0100,
            TierId::L4 => 0b1000,
        }
    }

    /// Lowercase name used in config sections and wire formats
    pub fn as_str(self) -> &'static str {
        match self {
            TierId::L1 => "l1",
            TierId::L2 => "l2",
            TierId::L3 => "l3",
            TierId::L4 => "l4",
        }
    }

    /// Human-readable description of the tier's role
    pub fn role(self) -> &'static str {
        match self {
            TierId::L1 => "in-process",
            TierId::L2 => "shared-cache",
            TierId::L3 => "durable",
            TierId::L4 => "similarity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "l1" => Some(TierId::L1),
            "l2" => Some(TierId::L2),
            "l3" => Some(TierId::L3),
            "l4" => Some(TierId::L4),
            _ => None,
        }
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TierId::L1 => "L1",
            TierId::L2 => "L2",
            TierId::L3 => "L3",
            TierId::L4 => "L4",
        };
        f.write_str(label)
    }
}

/// Bitset of tiers that hold a physically present copy of an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TierMask(u8);

impl TierMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn of(tiers: &[TierId]) -> Self {
        tiers.iter().fold(Self::empty(), |mask, t| mask.with(*t))
    }

    pub fn with(self, tier: TierId) -> Self {
        Self(self.0 | tier.bit())
    }

    pub fn without(self, tier: TierId) -> Self {
        Self(self.0 & !tier.bit())
    }

    pub fn insert(&mut self, tier: TierId) {
        self.0 |= tier.bit();
    }

    pub fn remove(&mut self, tier: TierId) {
        self.0 &= !tier.bit();
    }

    pub fn contains(self, tier: TierId) -> bool {
        self.0 & tier.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Tiers present in the mask, fastest first
    pub fn iter(self) -> impl Iterator<Item = TierId> {
        TierId::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

/// Whether the durable tier may ever drop an entry on its own
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Must survive until explicitly deleted or expired
    #[default]
    Required,
    /// May be evicted by the durable tier under capacity pressure
    Ephemeral,
}

impl Durability {
    pub fn as_str(self) -> &'static str {
        match self {
            Durability::Required => "required",
            Durability::Ephemeral => "ephemeral",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "required" => Some(Durability::Required),
            "ephemeral" => Some(Durability::Ephemeral),
            _ => None,
        }
    }
}

/// A single entry stored in the tier hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Namespaced identifier
    pub key: EntryKey,
    /// Opaque payload; the manager never inspects it
    pub value: Bytes,
    /// Optional fixed-length vector for similarity search
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Mutable tags (importance, source, content-type, ...)
    #[serde(default)]
    pub metadata: Metadata,
    /// When the entry was first written
    pub created_at: DateTime<Utc>,
    /// Updated on every successful read (best effort)
    pub last_accessed_at: DateTime<Utc>,
    /// Reads since creation or since the last optimizer reset
    #[serde(default)]
    pub access_count: u64,
    /// Absolute expiry instant; expired entries are logically deleted
    #[serde(default)]
    pub ttl: Option<DateTime<Utc>>,
    /// Write-sequence number used to order concurrent writers
    pub sequence: u64,
    /// Durability class
    #[serde(default)]
    pub durability: Durability,
    /// Tiers known to hold a physical copy
    #[serde(default)]
    pub tier_mask: TierMask,
}

impl MemoryEntry {
    /// Create an entry with no metadata, embedding or expiry
    pub fn new(key: EntryKey, value: impl Into<Bytes>, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            key,
            value: value.into(),
            embedding: None,
            metadata: Metadata::new(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            ttl: None,
            sequence,
            durability: Durability::Required,
            tier_mask: TierMask::empty(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_ttl(mut self, ttl: DateTime<Utc>) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// True once `now` has reached the entry's expiry instant
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_some_and(|ttl| now >= ttl)
    }

    /// Record a successful read
    pub fn mark_accessed(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }
    }

    /// Entries carrying an embedding and tagged `searchable = "true"`
    pub fn is_searchable(&self) -> bool {
        self.embedding.is_some()
            && self
                .metadata
                .get(SEARCHABLE_TAG)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Approximate in-memory footprint used for byte-bounded capacity
    pub fn size_bytes(&self) -> usize {
        let metadata: usize = self.metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
        let embedding = self.embedding.as_ref().map_or(0, |e| e.len() * 4);
        self.key.namespace.len() + self.key.key.len() + self.value.len() + metadata + embedding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(key: &str) -> MemoryEntry {
        MemoryEntry::new(EntryKey::from(key), Bytes::from_static(b"value"), 1, Utc::now())
    }

    #[test]
    fn test_bare_key_uses_default_namespace() {
        let key = EntryKey::from("a");
        assert_eq!(key.namespace, DEFAULT_NAMESPACE);
        assert_eq!(key.to_string(), "default/a");

        let scoped = EntryKey::from(("user-42", "prefs"));
        assert_eq!(scoped.to_string(), "user-42/prefs");
    }

    #[test]
    fn test_tier_mask_operations() {
        let mut mask = TierMask::of(&[TierId::L1, TierId::L3]);
        assert!(mask.contains(TierId::L1));
        assert!(!mask.contains(TierId::L2));
        assert!(mask.contains(TierId::L3));

        mask.insert(TierId::L2);
        mask.remove(TierId::L1);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![TierId::L2, TierId::L3]);
        assert!(TierMask::empty().is_empty());
        assert_eq!(TierMask::empty().with(TierId::L4).bits(), 0b1000);
    }

    #[test]
    fn test_tier_id_parse_and_order() {
        assert_eq!(TierId::parse("L2"), Some(TierId::L2));
        assert_eq!(TierId::parse("l4"), Some(TierId::L4));
        assert_eq!(TierId::parse("l9"), None);
        assert!(TierId::L1 < TierId::L3);
    }

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let e = entry("a").with_ttl(now + Duration::seconds(1));
        assert!(!e.is_expired(now + Duration::milliseconds(900)));
        assert!(e.is_expired(now + Duration::seconds(1)));
        assert!(e.is_expired(now + Duration::milliseconds(1100)));
        assert!(!entry("b").is_expired(now + Duration::days(365)));
    }

    #[test]
    fn test_searchable_requires_tag_and_embedding() {
        let mut metadata = Metadata::new();
        metadata.insert(SEARCHABLE_TAG.to_string(), "true".to_string());

        assert!(!entry("a").with_metadata(metadata.clone()).is_searchable());
        assert!(!entry("a").with_embedding(vec![0.1; 4]).is_searchable());
        assert!(
            entry("a")
                .with_embedding(vec![0.1; 4])
                .with_metadata(metadata)
                .is_searchable()
        );
    }

    #[test]
    fn test_mark_accessed_never_moves_backwards() {
        let mut e = entry("a");
        let later = e.last_accessed_at + Duration::seconds(5);
        e.mark_accessed(later);
        e.mark_accessed(later - Duration::seconds(10));
        assert_eq!(e.access_count, 2);
        assert_eq!(e.last_accessed_at, later);
    }

    #[test]
    fn test_entry_json_preserves_bytes() {
        let e = MemoryEntry::new(
            EntryKey::from("bin"),
            Bytes::from(vec![0u8, 159, 146, 150, 255]),
            42,
            Utc::now(),
        )
        .with_durability(Durability::Ephemeral);

        let json = serde_json::to_string(&e).expect("serialize entry");
        let back: MemoryEntry = serde_json::from_str(&json).expect("deserialize entry");
        assert_eq!(back, e);
    }
}
