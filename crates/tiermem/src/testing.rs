//! Test utilities for tiermem
//!
//! - `MemoryTier`: a map-backed tier usable at any level, including as a
//!   brute-force similarity tier
//! - `FaultyTier`: wraps a tier with injectable unavailability and latency
//! - `MockEmbedder`: deterministic embeddings without a model

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{MemoryError, Result};
use crate::memory::types::{Durability, EntryKey, MemoryEntry, TierId};
use crate::tier::{
    Capacity, EvictionHint, ScoredEntry, SearchFilter, SimilarityStore, TierDescriptor, TierStats,
    TierStore, check_sequence,
};

/// Unbounded in-memory tier
#[derive(Debug)]
pub struct MemoryTier {
    descriptor: TierDescriptor,
    entries: Mutex<HashMap<EntryKey, MemoryEntry>>,
    evictions: AtomicU64,
}

impl MemoryTier {
    pub fn new(id: TierId) -> Self {
        Self::with_descriptor(TierDescriptor::new(id))
    }

    pub fn with_descriptor(descriptor: TierDescriptor) -> Self {
        Self {
            descriptor,
            entries: Mutex::new(HashMap::new()),
            evictions: AtomicU64::new(0),
        }
    }

    /// Stand-in for the durable tier
    pub fn durable() -> Self {
        Self::new(TierId::L3)
    }

    /// Stand-in for the similarity tier
    pub fn similarity() -> Self {
        Self::new(TierId::L4)
    }

    /// Shared-cache stand-in with promotion thresholds
    pub fn shared(promote: f64, retain: f64) -> Self {
        Self::with_descriptor(
            TierDescriptor::new(TierId::L2)
                .with_capacity(Capacity::unbounded())
                .with_thresholds(promote, retain),
        )
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Inspect a stored entry without touching access stats
    pub fn peek(&self, key: &EntryKey) -> Option<MemoryEntry> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EntryKey, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TierStore for MemoryTier {
    fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    async fn get(&self, key: &EntryKey) -> Result<Option<MemoryEntry>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, entry: &MemoryEntry) -> Result<()> {
        let mut entries = self.lock();
        check_sequence(
            &entry.key,
            entries.get(&entry.key).map(|e| e.sequence),
            entry.sequence,
        )?;
        entries.insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &EntryKey) -> Result<bool> {
        Ok(self.lock().remove(key).is_some())
    }

    async fn approximate_size(&self) -> Result<TierStats> {
        let entries = self.lock();
        Ok(TierStats {
            entries: entries.len() as u64,
            bytes: entries.values().map(|e| e.size_bytes() as u64).sum(),
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }

    async fn evict(&self, hint: EvictionHint) -> Result<Vec<EntryKey>> {
        let mut entries = self.lock();
        let durable = self.descriptor.id == TierId::L3;
        let mut candidates: Vec<(DateTime<Utc>, EntryKey)> = entries
            .values()
            .filter(|e| !durable || e.durability == Durability::Ephemeral)
            .map(|e| (e.last_accessed_at, e.key.clone()))
            .collect();
        candidates.sort();
        let evicted: Vec<EntryKey> = candidates
            .into_iter()
            .take(hint.max_keys)
            .map(|(_, key)| key)
            .collect();
        for key in &evicted {
            entries.remove(key);
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        Ok(evicted)
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EntryKey>> {
        let mut entries = self.lock();
        let expired: Vec<EntryKey> = entries
            .values()
            .filter(|e| e.is_expired(now))
            .take(limit)
            .map(|e| e.key.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        Ok(expired)
    }
}

#[async_trait]
impl SimilarityStore for MemoryTier {
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredEntry>> {
        let entries = self.lock();
        let mut hits: Vec<ScoredEntry> = entries
            .values()
            .filter(|e| filter.namespace.as_ref().is_none_or(|ns| &e.key.namespace == ns))
            .filter(|e| filter.since.is_none_or(|since| e.created_at >= since))
            .filter_map(|e| {
                let embedding = e.embedding.as_ref()?;
                let distance = l2_distance(query, embedding);
                filter.matches(e, distance).then(|| ScoredEntry {
                    entry: e.clone(),
                    distance,
                })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
}

/// Wraps any tier with injectable faults
pub struct FaultyTier<T: ?Sized> {
    inner: Arc<T>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    gets: AtomicU64,
    sets: AtomicU64,
}

impl<T: ?Sized> std::fmt::Debug for FaultyTier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyTier")
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .field("latency_ms", &self.latency_ms.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: TierStore + ?Sized> FaultyTier<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self {
            inner,
            unavailable: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }

    /// Make every call fail with `TierUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> u64 {
        self.sets.load(Ordering::SeqCst)
    }

    async fn fault(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MemoryError::unavailable(
                self.inner.id(),
                "injected fault",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: TierStore + ?Sized> TierStore for FaultyTier<T> {
    fn descriptor(&self) -> &TierDescriptor {
        self.inner.descriptor()
    }

    async fn get(&self, key: &EntryKey) -> Result<Option<MemoryEntry>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.fault().await?;
        self.inner.get(key).await
    }

    async fn set(&self, entry: &MemoryEntry) -> Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.fault().await?;
        self.inner.set(entry).await
    }

    async fn delete(&self, key: &EntryKey) -> Result<bool> {
        self.fault().await?;
        self.inner.delete(key).await
    }

    async fn approximate_size(&self) -> Result<TierStats> {
        self.fault().await?;
        self.inner.approximate_size().await
    }

    async fn evict(&self, hint: EvictionHint) -> Result<Vec<EntryKey>> {
        self.fault().await?;
        self.inner.evict(hint).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EntryKey>> {
        self.fault().await?;
        self.inner.purge_expired(now, limit).await
    }

    async fn set_many(&self, entries: &[MemoryEntry]) -> Vec<Result<()>> {
        if let Err(e) = self.fault().await {
            return entries
                .iter()
                .map(|_| Err(MemoryError::unavailable(self.inner.id(), e.to_string())))
                .collect();
        }
        self.inner.set_many(entries).await
    }
}

/// Deterministic embeddings for tests
#[derive(Debug, Clone, Copy)]
pub struct MockEmbedder {
    pub dimension: usize,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self { dimension: 8 }
    }
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    /// Pseudo-random unit vector seeded by the text hash
    pub fn embed(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();

        let raw: Vec<f32> = (0..self.dimension)
            .map(|i| {
                let x = seed
                    .wrapping_mul(i as u64 + 1)
                    .wrapping_add(0x9e3779b97f4a7c15);
                ((x >> 11) as f32 / (1u64 << 53) as f32) * 2.0 - 1.0
            })
            .collect();
        let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
        raw.into_iter().map(|v| v / norm).collect()
    }

    /// Unit vector along one axis; handy for exact nearest-neighbour checks
    pub fn axis(&self, index: usize) -> Vec<f32> {
        let mut v = vec![0.0; self.dimension];
        if let Some(slot) = v.get_mut(index % self.dimension.max(1)) {
            *slot = 1.0;
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_embedding_is_deterministic_unit_vector() {
        let embedder = MockEmbedder::new(16);
        let a = embedder.embed("hello");
        assert_eq!(a, embedder.embed("hello"));
        assert_ne!(a, embedder.embed("world"));
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn faulty_tier_injects_unavailability() {
        let tier = FaultyTier::new(Arc::new(MemoryTier::durable()));
        let entry = MemoryEntry::new(EntryKey::from("a"), "x", 1, Utc::now());
        tier.set(&entry).await.unwrap();

        tier.set_unavailable(true);
        let err = tier.get(&entry.key).await.unwrap_err();
        assert!(matches!(err, MemoryError::TierUnavailable { tier: TierId::L3, .. }));

        tier.set_unavailable(false);
        assert!(tier.get(&entry.key).await.unwrap().is_some());
        assert_eq!(tier.gets(), 2);
    }

    #[tokio::test]
    async fn memory_tier_searches_by_distance() {
        let tier = MemoryTier::similarity();
        let embedder = MockEmbedder::new(4);
        let now = Utc::now();
        for i in 0..3 {
            let entry = MemoryEntry::new(EntryKey::from(format!("k{i}").as_str()), "v", 1, now)
                .with_embedding(embedder.axis(i));
            tier.set(&entry).await.unwrap();
        }
        let hits = tier.search(&embedder.axis(1), 2, &SearchFilter::new()).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.key.key, "k1");
        assert_eq!(hits[0].distance, 0.0);
    }

    #[tokio::test]
    async fn memory_tier_rejects_stale_write() {
        let tier = MemoryTier::durable();
        let now = Utc::now();
        tier.set(&MemoryEntry::new(EntryKey::from("a"), "new", 5, now))
            .await
            .unwrap();
        let err = tier
            .set(&MemoryEntry::new(EntryKey::from("a"), "old", 4, now))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::StaleWriteRejected { stored: 5, attempted: 4, .. }));
    }
}
