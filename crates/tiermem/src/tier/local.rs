//! In-process tier (L1)
//!
//! A bounded map guarded by a single mutex. Recency order comes from
//! `lru::LruCache`; when the policy is LFU a `(hits, tick, key)` index picks
//! the victim instead. Capacity is enforced on every insert by evicting
//! according to the descriptor's policy.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::trace;

use super::{EvictionHint, EvictionPolicy, TierDescriptor, TierStats, TierStore, check_sequence};
use crate::error::{MemoryError, Result};
use crate::memory::types::{EntryKey, MemoryEntry, TierId};

struct Slot {
    entry: MemoryEntry,
    size: u64,
    hits: u64,
    tick: u64,
}

struct State {
    map: LruCache<EntryKey, Slot>,
    lfu: BTreeSet<(u64, u64, EntryKey)>,
    bytes: u64,
    tick: u64,
    evictions: u64,
}

impl State {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &EntryKey) -> Option<Slot> {
        let slot = self.map.pop(key)?;
        self.bytes = self.bytes.saturating_sub(slot.size);
        self.lfu.remove(&(slot.hits, slot.tick, key.clone()));
        Some(slot)
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<EntryKey> {
        match policy {
            EvictionPolicy::Lru => self.map.peek_lru().map(|(k, _)| k.clone()),
            EvictionPolicy::Lfu => self.lfu.first().map(|(_, _, k)| k.clone()),
            EvictionPolicy::None => None,
        }
    }
}

pub struct LocalTier {
    descriptor: TierDescriptor,
    state: Mutex<State>,
}

impl LocalTier {
    pub fn new(descriptor: TierDescriptor) -> Self {
        Self {
            descriptor,
            state: Mutex::new(State {
                map: LruCache::unbounded(),
                lfu: BTreeSet::new(),
                bytes: 0,
                tick: 0,
                evictions: 0,
            }),
        }
    }

    /// L1 descriptor with an entry-count bound and LRU eviction
    pub fn with_max_entries(max_entries: u64) -> Self {
        Self::new(
            TierDescriptor::new(TierId::L1)
                .with_capacity(super::Capacity::entries(max_entries))
                .with_eviction(EvictionPolicy::Lru),
        )
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.state().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently held, most recently used first
    pub fn keys(&self) -> Vec<EntryKey> {
        self.state().map.iter().map(|(k, _)| k.clone()).collect()
    }

    fn evict_one(&self, state: &mut State, policy: EvictionPolicy) -> Option<EntryKey> {
        let key = state.victim(policy)?;
        state.remove(&key);
        state.evictions += 1;
        trace!(key = %key, "L1 evicted");
        Some(key)
    }
}

#[async_trait]
impl TierStore for LocalTier {
    fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    async fn get(&self, key: &EntryKey) -> Result<Option<MemoryEntry>> {
        let track_lfu = self.descriptor.eviction == EvictionPolicy::Lfu;
        let mut state = self.state();
        let tick = state.next_tick();
        let Some(slot) = state.map.get_mut(key) else {
            return Ok(None);
        };
        let previous = (slot.hits, slot.tick);
        slot.hits += 1;
        slot.tick = tick;
        let current = (slot.hits, slot.tick);
        let entry = slot.entry.clone();
        if track_lfu {
            state.lfu.remove(&(previous.0, previous.1, key.clone()));
            state.lfu.insert((current.0, current.1, key.clone()));
        }
        Ok(Some(entry))
    }

    async fn set(&self, entry: &MemoryEntry) -> Result<()> {
        let capacity = self.descriptor.capacity;
        let policy = self.descriptor.eviction;
        let size = entry.size_bytes() as u64;
        if capacity.max_bytes.is_some_and(|max| size > max) {
            return Err(MemoryError::CapacityExceeded { tier: self.id() });
        }

        let mut state = self.state();
        let existing = state.map.peek(&entry.key).map(|s| (s.entry.sequence, s.hits));
        check_sequence(&entry.key, existing.map(|(seq, _)| seq), entry.sequence)?;
        let hits = existing.map_or(0, |(_, hits)| hits);
        if existing.is_some() {
            state.remove(&entry.key);
        }

        loop {
            let over_entries = capacity
                .max_entries
                .is_some_and(|max| state.map.len() as u64 >= max);
            let over_bytes = capacity
                .max_bytes
                .is_some_and(|max| state.bytes + size > max);
            if !over_entries && !over_bytes {
                break;
            }
            if self.evict_one(&mut state, policy).is_none() {
                return Err(MemoryError::CapacityExceeded { tier: self.id() });
            }
        }

        let tick = state.next_tick();
        state.bytes += size;
        if policy == EvictionPolicy::Lfu {
            state.lfu.insert((hits, tick, entry.key.clone()));
        }
        state.map.put(
            entry.key.clone(),
            Slot {
                entry: entry.clone(),
                size,
                hits,
                tick,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &EntryKey) -> Result<bool> {
        Ok(self.state().remove(key).is_some())
    }

    async fn exists(&self, key: &EntryKey) -> Result<bool> {
        Ok(self.state().map.contains(key))
    }

    async fn approximate_size(&self) -> Result<TierStats> {
        let state = self.state();
        Ok(TierStats {
            entries: state.map.len() as u64,
            bytes: state.bytes,
            evictions: state.evictions,
        })
    }

    async fn evict(&self, hint: EvictionHint) -> Result<Vec<EntryKey>> {
        let policy = match hint.policy {
            EvictionPolicy::None => self.descriptor.eviction,
            other => other,
        };
        let mut state = self.state();
        let mut evicted = Vec::new();
        // the LFU index is only maintained for LFU tiers
        let policy = if policy == EvictionPolicy::Lfu && self.descriptor.eviction != EvictionPolicy::Lfu {
            EvictionPolicy::Lru
        } else {
            policy
        };
        while evicted.len() < hint.max_keys {
            match self.evict_one(&mut state, policy) {
                Some(key) => evicted.push(key),
                None => break,
            }
        }
        Ok(evicted)
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EntryKey>> {
        let mut state = self.state();
        let expired: Vec<EntryKey> = state
            .map
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .take(limit)
            .collect();
        for key in &expired {
            state.remove(key);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::Capacity;
    use chrono::Duration;

    fn entry(key: &str, seq: u64) -> MemoryEntry {
        MemoryEntry::new(EntryKey::from(key), format!("value-{key}"), seq, Utc::now())
    }

    mod lru_policy {
        use super::*;

        #[tokio::test]
        async fn test_evicts_least_recently_used() {
            let tier = LocalTier::with_max_entries(2);
            tier.set(&entry("a", 1)).await.unwrap();
            tier.set(&entry("b", 1)).await.unwrap();
            // touch a so b becomes the LRU
            tier.get(&EntryKey::from("a")).await.unwrap();
            tier.set(&entry("c", 1)).await.unwrap();

            assert!(tier.exists(&EntryKey::from("a")).await.unwrap());
            assert!(!tier.exists(&EntryKey::from("b")).await.unwrap());
            assert!(tier.exists(&EntryKey::from("c")).await.unwrap());
            assert_eq!(tier.approximate_size().await.unwrap().evictions, 1);
        }

        #[tokio::test]
        async fn test_overwrite_does_not_evict() {
            let tier = LocalTier::with_max_entries(2);
            tier.set(&entry("a", 1)).await.unwrap();
            tier.set(&entry("b", 1)).await.unwrap();
            tier.set(&entry("a", 2)).await.unwrap();
            assert_eq!(tier.len(), 2);
            assert_eq!(tier.approximate_size().await.unwrap().evictions, 0);
        }

        #[tokio::test]
        async fn test_explicit_evict_hint() {
            let tier = LocalTier::with_max_entries(10);
            for key in ["a", "b", "c"] {
                tier.set(&entry(key, 1)).await.unwrap();
            }
            let evicted = tier
                .evict(EvictionHint {
                    max_keys: 2,
                    policy: EvictionPolicy::Lru,
                })
                .await
                .unwrap();
            assert_eq!(evicted, vec![EntryKey::from("a"), EntryKey::from("b")]);
            assert_eq!(tier.keys(), vec![EntryKey::from("c")]);
        }
    }

    mod lfu_policy {
        use super::*;

        #[tokio::test]
        async fn test_evicts_least_frequently_used() {
            let tier = LocalTier::new(
                TierDescriptor::new(TierId::L1)
                    .with_capacity(Capacity::entries(2))
                    .with_eviction(EvictionPolicy::Lfu),
            );
            tier.set(&entry("a", 1)).await.unwrap();
            tier.set(&entry("b", 1)).await.unwrap();
            for _ in 0..3 {
                tier.get(&EntryKey::from("a")).await.unwrap();
            }
            tier.get(&EntryKey::from("b")).await.unwrap();
            tier.set(&entry("c", 1)).await.unwrap();

            assert!(tier.exists(&EntryKey::from("a")).await.unwrap());
            assert!(!tier.exists(&EntryKey::from("b")).await.unwrap());
        }
    }

    mod capacity {
        use super::*;

        #[tokio::test]
        async fn test_no_eviction_policy_rejects_when_full() {
            let tier = LocalTier::new(
                TierDescriptor::new(TierId::L1)
                    .with_capacity(Capacity::entries(1))
                    .with_eviction(EvictionPolicy::None),
            );
            tier.set(&entry("a", 1)).await.unwrap();
            let err = tier.set(&entry("b", 1)).await.unwrap_err();
            assert!(matches!(err, MemoryError::CapacityExceeded { tier: TierId::L1 }));
        }

        #[tokio::test]
        async fn test_oversized_entry_rejected() {
            let tier = LocalTier::new(
                TierDescriptor::new(TierId::L1).with_capacity(Capacity::unbounded().with_max_bytes(8)),
            );
            let err = tier.set(&entry("large-key", 1)).await.unwrap_err();
            assert!(matches!(err, MemoryError::CapacityExceeded { .. }));
        }

        #[tokio::test]
        async fn test_byte_bound_evicts() {
            let one = entry("a", 1).size_bytes() as u64;
            let tier = LocalTier::new(
                TierDescriptor::new(TierId::L1)
                    .with_capacity(Capacity::unbounded().with_max_bytes(one * 2)),
            );
            tier.set(&entry("a", 1)).await.unwrap();
            tier.set(&entry("b", 1)).await.unwrap();
            tier.set(&entry("c", 1)).await.unwrap();
            let stats = tier.approximate_size().await.unwrap();
            assert_eq!(stats.entries, 2);
            assert!(stats.bytes <= one * 2);
        }
    }

    mod consistency {
        use super::*;

        #[tokio::test]
        async fn test_stale_write_rejected() {
            let tier = LocalTier::with_max_entries(10);
            tier.set(&entry("a", 5)).await.unwrap();
            let err = tier.set(&entry("a", 4)).await.unwrap_err();
            assert!(matches!(err, MemoryError::StaleWriteRejected { stored: 5, attempted: 4, .. }));
            // equal sequence is an idempotent replay
            tier.set(&entry("a", 5)).await.unwrap();
        }

        #[tokio::test]
        async fn test_purge_expired() {
            let tier = LocalTier::with_max_entries(10);
            let now = Utc::now();
            tier.set(&entry("old", 1).with_ttl(now - Duration::seconds(1)))
                .await
                .unwrap();
            tier.set(&entry("live", 1).with_ttl(now + Duration::hours(1)))
                .await
                .unwrap();
            tier.set(&entry("forever", 1)).await.unwrap();

            let purged = tier.purge_expired(now, 100).await.unwrap();
            assert_eq!(purged, vec![EntryKey::from("old")]);
            assert_eq!(tier.len(), 2);
            assert!(tier.purge_expired(now, 100).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_delete_reports_presence() {
            let tier = LocalTier::with_max_entries(10);
            tier.set(&entry("a", 1)).await.unwrap();
            assert!(tier.delete(&EntryKey::from("a")).await.unwrap());
            assert!(!tier.delete(&EntryKey::from("a")).await.unwrap());
            assert_eq!(tier.approximate_size().await.unwrap().bytes, 0);
        }
    }
}
