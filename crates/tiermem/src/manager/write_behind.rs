//! Write-behind buffer
//!
//! Holds acknowledged writes that have not reached the durable tier yet.
//! Each key keeps the deadline of its oldest unflushed write, so a key that
//! is rewritten continuously is still flushed within the staleness bound.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::{MemoryError, Result};
use crate::memory::types::{EntryKey, MemoryEntry};

#[derive(Debug, Clone)]
struct Buffered {
    entry: MemoryEntry,
    explicit: bool,
    deadline: Instant,
}

/// A write taken out of the buffer for flushing
#[derive(Debug, Clone)]
pub struct BufferedWrite {
    pub entry: MemoryEntry,
    /// The caller chose the sequence; the manager must not reassign it
    pub explicit: bool,
}

#[derive(Debug)]
pub struct WriteBehindBuffer {
    entries: DashMap<EntryKey, Buffered>,
    max_staleness: Duration,
}

impl WriteBehindBuffer {
    pub fn new(max_staleness: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_staleness,
        }
    }

    pub fn max_staleness(&self) -> Duration {
        self.max_staleness
    }

    /// Buffer a write, rejecting one older than the buffered value
    pub fn insert(&self, entry: MemoryEntry, explicit: bool) -> Result<()> {
        match self.entries.entry(entry.key.clone()) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get().entry.sequence;
                if entry.sequence < stored {
                    return Err(MemoryError::StaleWriteRejected {
                        key: entry.key.to_string(),
                        stored,
                        attempted: entry.sequence,
                    });
                }
                let buffered = slot.get_mut();
                buffered.entry = entry;
                buffered.explicit = explicit;
            }
            Entry::Vacant(slot) => {
                slot.insert(Buffered {
                    entry,
                    explicit,
                    deadline: Instant::now() + self.max_staleness,
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &EntryKey) -> Option<MemoryEntry> {
        self.entries.get(key).map(|b| b.entry.clone())
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove and return the buffered write
    pub fn take(&self, key: &EntryKey) -> Option<BufferedWrite> {
        self.entries.remove(key).map(|(_, b)| BufferedWrite {
            entry: b.entry,
            explicit: b.explicit,
        })
    }

    /// Put back a write whose flush failed, unless a newer one arrived
    pub fn restore(&self, write: BufferedWrite) {
        match self.entries.entry(write.entry.key.clone()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(Buffered {
                    entry: write.entry,
                    explicit: write.explicit,
                    deadline: Instant::now(),
                });
            }
        }
    }

    /// Keys whose deadline falls within `margin` of now
    pub fn due(&self, margin: Duration) -> Vec<EntryKey> {
        let horizon = Instant::now() + margin;
        let mut due: Vec<(Instant, EntryKey)> = self
            .entries
            .iter()
            .filter(|b| b.deadline <= horizon)
            .map(|b| (b.deadline, b.key().clone()))
            .collect();
        due.sort();
        due.into_iter().map(|(_, k)| k).collect()
    }

    pub fn keys(&self) -> Vec<EntryKey> {
        self.entries.iter().map(|b| b.key().clone()).collect()
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
    use chrono::Utc;

    use super::*;

    fn entry(key: &str, value: &str, sequence: u64) -> MemoryEntry {
        MemoryEntry::new(EntryKey::from(key), value.to_string(), sequence, Utc::now())
    }

    #[test]
    fn test_newer_write_replaces() {
        let buffer = WriteBehindBuffer::new(Duration::from_secs(1));
        buffer.insert(entry("a", "1", 1), false).unwrap();
        buffer.insert(entry("a", "2", 2), false).unwrap();
        assert_eq!(buffer.get(&EntryKey::from("a")).unwrap().value, "2");
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_older_write_rejected() {
        let buffer = WriteBehindBuffer::new(Duration::from_secs(1));
        buffer.insert(entry("a", "2", 2), false).unwrap();
        let err = buffer.insert(entry("a", "1", 1), false).unwrap_err();
        assert!(matches!(err, MemoryError::StaleWriteRejected { stored: 2, attempted: 1, .. }));
    }

    #[test]
    fn test_deadline_kept_across_rewrites() {
        let buffer = WriteBehindBuffer::new(Duration::from_millis(20));
        buffer.insert(entry("a", "1", 1), false).unwrap();
        std::thread::sleep(Duration::from_millis(25));
        buffer.insert(entry("a", "2", 2), false).unwrap();
        assert_eq!(buffer.due(Duration::ZERO), vec![EntryKey::from("a")]);
    }

    #[test]
    fn test_restore_does_not_clobber_newer() {
        let buffer = WriteBehindBuffer::new(Duration::from_secs(1));
        let old = entry("a", "1", 1);
        buffer.insert(old.clone(), true).unwrap();
        let taken = buffer.take(&old.key).unwrap();
        assert!(taken.explicit);
        buffer.insert(entry("a", "2", 2), false).unwrap();
        buffer.restore(taken);
        assert_eq!(buffer.get(&old.key).unwrap().sequence, 2);

        let newer = buffer.take(&old.key).unwrap();
        assert!(!newer.explicit);
        buffer.restore(BufferedWrite {
            entry: old.clone(),
            explicit: true,
        });
        assert!(buffer.due(Duration::ZERO).contains(&old.key));
    }
}
