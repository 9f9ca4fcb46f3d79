//! Recently deleted keys
//!
//! A delete records the sequence it was issued at. Until the grace period
//! runs out, any write or background promotion carrying a sequence at or
//! below that value is refused, so a slow fast-tier copy cannot bring the
//! key back.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::types::EntryKey;

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    sequence: u64,
    deleted_at: Instant,
}

#[derive(Debug)]
pub struct TombstoneRegistry {
    entries: DashMap<EntryKey, Tombstone>,
    grace: Duration,
}

impl TombstoneRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            grace,
        }
    }

    /// Record a delete; keeps the highest sequence if the key was already tombstoned
    pub fn record(&self, key: &EntryKey, sequence: u64) {
        let now = Instant::now();
        self.entries
            .entry(key.clone())
            .and_modify(|t| {
                t.sequence = t.sequence.max(sequence);
                t.deleted_at = now;
            })
            .or_insert(Tombstone {
                sequence,
                deleted_at: now,
            });
    }

    /// Delete sequence for a key still inside its grace period
    pub fn sequence(&self, key: &EntryKey) -> Option<u64> {
        let tomb = *self.entries.get(key)?;
        if tomb.deleted_at.elapsed() > self.grace {
            self.entries.remove_if(key, |_, t| t.deleted_at == tomb.deleted_at);
            return None;
        }
        Some(tomb.sequence)
    }

    /// True when a copy written at `sequence` predates the delete
    pub fn blocks(&self, key: &EntryKey, sequence: u64) -> bool {
        self.sequence(key).is_some_and(|deleted| sequence <= deleted)
    }

    /// Drop tombstones past their grace period
    pub fn prune(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, t| t.deleted_at.elapsed() <= self.grace);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_older_and_equal_sequences() {
        let registry = TombstoneRegistry::new(Duration::from_secs(60));
        let key = EntryKey::from("a");
        registry.record(&key, 10);

        assert!(registry.blocks(&key, 9));
        assert!(registry.blocks(&key, 10));
        assert!(!registry.blocks(&key, 11));
        assert!(!registry.blocks(&EntryKey::from("b"), 1));
    }

    #[test]
    fn test_record_keeps_highest_sequence() {
        let registry = TombstoneRegistry::new(Duration::from_secs(60));
        let key = EntryKey::from("a");
        registry.record(&key, 10);
        registry.record(&key, 4);
        assert_eq!(registry.sequence(&key), Some(10));
    }

    #[test]
    fn test_grace_period_expires() {
        let registry = TombstoneRegistry::new(Duration::ZERO);
        let key = EntryKey::from("a");
        registry.record(&key, 10);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(registry.sequence(&key), None);
        registry.record(&EntryKey::from("b"), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.prune(), 1);
        assert!(registry.is_empty());
    }
}
