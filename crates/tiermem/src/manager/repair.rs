//! Fast-tier repair queue
//!
//! Cache-tier writes and deletes that did not complete inline are recorded
//! here and retried until verified. While a repair is pending for a
//! (tier, key) pair, reads skip that tier for that key, so a stale copy can
//! never be served.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::memory::types::{EntryKey, MemoryEntry, TierId};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum RepairOp {
    /// Make the tier hold this version (or none at all)
    Upsert(MemoryEntry),
    /// Make the tier forget the key
    Delete,
}

#[derive(Debug, Clone)]
pub struct Repair {
    pub op: RepairOp,
    pub generation: u64,
    pub attempts: u32,
    next_attempt: Instant,
}

#[derive(Debug)]
pub struct RepairQueue {
    pending: DashMap<(TierId, EntryKey), Repair>,
    generation: AtomicU64,
    base_delay: Duration,
    notify: Notify,
}

impl RepairQueue {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
            base_delay: base_delay.max(Duration::from_millis(1)),
            notify: Notify::new(),
        }
    }

    /// Record a repair, replacing any older one for the same slot
    pub fn record(&self, tier: TierId, key: &EntryKey, op: RepairOp) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.insert(
            (tier, key.clone()),
            Repair {
                op,
                generation,
                attempts: 0,
                next_attempt: Instant::now(),
            },
        );
        self.notify.notify_one();
        generation
    }

    pub fn is_pending(&self, tier: TierId, key: &EntryKey) -> bool {
        self.pending.contains_key(&(tier, key.clone()))
    }

    pub fn current(&self, tier: TierId, key: &EntryKey) -> Option<Repair> {
        self.pending.get(&(tier, key.clone())).map(|r| r.clone())
    }

    /// Slots whose next attempt is due, oldest generation first
    pub fn due(&self, limit: usize) -> Vec<(TierId, EntryKey)> {
        let now = Instant::now();
        let mut due: Vec<(u64, TierId, EntryKey)> = self
            .pending
            .iter()
            .filter(|r| r.next_attempt <= now)
            .map(|r| (r.generation, r.key().0, r.key().1.clone()))
            .collect();
        due.sort_by_key(|(generation, _, _)| *generation);
        due.into_iter()
            .take(limit)
            .map(|(_, tier, key)| (tier, key))
            .collect()
    }

    /// Drop the repair if it is still the one that was applied
    pub fn complete(&self, tier: TierId, key: &EntryKey, generation: u64) -> bool {
        self.pending
            .remove_if(&(tier, key.clone()), |_, r| r.generation == generation)
            .is_some()
    }

    /// Schedule another attempt with exponential backoff
    pub fn retry_later(&self, tier: TierId, key: &EntryKey, generation: u64) {
        if let Some(mut repair) = self.pending.get_mut(&(tier, key.clone())) {
            if repair.generation != generation {
                return;
            }
            repair.attempts = repair.attempts.saturating_add(1);
            let backoff = self
                .base_delay
                .saturating_mul(1u32 << repair.attempts.min(16))
                .min(MAX_BACKOFF);
            repair.next_attempt = Instant::now() + backoff;
        }
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
