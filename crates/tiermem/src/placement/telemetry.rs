//! Per-key access telemetry
//!
//! A sharded map of rolling access windows. Each event carries the serving
//! tier and observed latency; events older than the window are pruned on
//! write and ignored on read.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::memory::types::{EntryKey, TierId, TierMask};

#[derive(Debug, Clone, Copy)]
pub struct AccessEvent {
    pub at: Instant,
    pub tier: TierId,
    pub latency: Duration,
}

#[derive(Debug)]
struct KeyTelemetry {
    events: VecDeque<AccessEvent>,
    last_access: Instant,
    size: u64,
    mask: TierMask,
    below_retention_since: [Option<Instant>; 4],
}

impl KeyTelemetry {
    fn new(now: Instant) -> Self {
        Self {
            events: VecDeque::new(),
            last_access: now,
            size: 0,
            mask: TierMask::empty(),
            below_retention_since: [None; 4],
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.events.front() {
            if now.duration_since(front.at) > window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Read-only view of a key's telemetry
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    /// Accesses inside the trailing window
    pub frequency: u64,
    pub since_last_access: Duration,
    pub size: u64,
    pub mask: TierMask,
    /// Mean latency of the tiers that served the windowed accesses
    pub served_latency: Duration,
    pub below_retention_since: [Option<Instant>; 4],
}

#[derive(Debug)]
pub struct AccessTelemetry {
    keys: DashMap<EntryKey, KeyTelemetry>,
    window: Duration,
    max_events: usize,
}

fn slot(tier: TierId) -> usize {
    match tier {
        TierId::L1 => 0,
        TierId::L2 => 1,
        TierId::L3 => 2,
        TierId::L4 => 3,
    }
}

impl AccessTelemetry {
    pub fn new(window: Duration, max_events: usize) -> Self {
        Self {
            keys: DashMap::new(),
            window,
            max_events: max_events.max(1),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a served read
    pub fn record(&self, key: &EntryKey, tier: TierId, latency: Duration, size: u64) {
        let now = Instant::now();
        let mut entry = self
            .keys
            .entry(key.clone())
            .or_insert_with(|| KeyTelemetry::new(now));
        entry.prune(now, self.window);
        if entry.events.len() >= self.max_events {
            entry.events.pop_front();
        }
        entry.events.push_back(AccessEvent {
            at: now,
            tier,
            latency,
        });
        entry.last_access = now;
        entry.size = size;
        entry.mask.insert(tier);
    }

    /// Note that `tier` now holds (or no longer holds) a copy
    pub fn set_present(&self, key: &EntryKey, tier: TierId, present: bool) {
        let now = Instant::now();
        let mut entry = self
            .keys
            .entry(key.clone())
            .or_insert_with(|| KeyTelemetry::new(now));
        if present {
            entry.mask.insert(tier);
        } else {
            entry.mask.remove(tier);
            entry.below_retention_since[slot(tier)] = None;
        }
    }

    pub fn set_size(&self, key: &EntryKey, size: u64) {
        if let Some(mut entry) = self.keys.get_mut(key) {
            entry.size = size;
        }
    }

    pub fn mask(&self, key: &EntryKey) -> TierMask {
        self.keys.get(key).map(|e| e.mask).unwrap_or_default()
    }

    pub fn snapshot(&self, key: &EntryKey) -> Option<KeySnapshot> {
        let entry = self.keys.get(key)?;
        let now = Instant::now();
        let windowed: Vec<&AccessEvent> = entry
            .events
            .iter()
            .filter(|e| now.duration_since(e.at) <= self.window)
            .collect();
        let served_latency = if windowed.is_empty() {
            Duration::ZERO
        } else {
            windowed.iter().map(|e| e.latency).sum::<Duration>() / windowed.len() as u32
        };
        Some(KeySnapshot {
            frequency: windowed.len() as u64,
            since_last_access: now.duration_since(entry.last_access),
            size: entry.size,
            mask: entry.mask,
            served_latency,
            below_retention_since: entry.below_retention_since,
        })
    }

    /// Start or clear the retention cool-down clock of a key in `tier`.
    /// Returns how long the key has been below retention.
    pub fn track_retention(&self, key: &EntryKey, tier: TierId, below: bool) -> Option<Duration> {
        let mut entry = self.keys.get_mut(key)?;
        let slot = &mut entry.below_retention_since[slot(tier)];
        if below {
            let since = *slot.get_or_insert_with(Instant::now);
            Some(since.elapsed())
        } else {
            *slot = None;
            None
        }
    }

    /// Keys believed to have a copy in `tier`, with their last access
    pub fn keys_in(&self, tier: TierId) -> Vec<(EntryKey, Instant, u64)> {
        let now = Instant::now();
        self.keys
            .iter()
            .filter(|e| e.mask.contains(tier))
            .map(|e| {
                let frequency = e
                    .events
                    .iter()
                    .filter(|ev| now.duration_since(ev.at) <= self.window)
                    .count() as u64;
                (e.key().clone(), e.last_access, frequency)
            })
            .collect()
    }

    /// Keys worth re-scoring: recently accessed or holding a fast-tier copy
    pub fn tracked_keys(&self) -> Vec<EntryKey> {
        self.keys
            .iter()
            .filter(|e| {
                !e.events.is_empty() || e.mask.contains(TierId::L1) || e.mask.contains(TierId::L2)
            })
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn forget(&self, key: &EntryKey) {
        self.keys.remove(key);
    }

    /// Drop keys idle for several windows. Their cache copies stay where
    /// they are and are rediscovered on the next access.
    pub fn prune_idle(&self) -> usize {
        let before = self.keys.len();
        let horizon = self.window * 4;
        self.keys.retain(|_, e| e.last_access.elapsed() <= horizon);
        before.saturating_sub(self.keys.len())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_counts_window_events() {
        let telemetry = AccessTelemetry::new(Duration::from_secs(60), 16);
        let key = EntryKey::from("a");
        for _ in 0..5 {
            telemetry.record(&key, TierId::L3, Duration::from_micros(400), 10);
        }
        let snap = telemetry.snapshot(&key).unwrap();
        assert_eq!(snap.frequency, 5);
        assert_eq!(snap.served_latency, Duration::from_micros(400));
        assert!(snap.mask.contains(TierId::L3));
        assert_eq!(snap.size, 10);
    }

    #[test]
    fn test_events_capped_per_key() {
        let telemetry = AccessTelemetry::new(Duration::from_secs(60), 3);
        let key = EntryKey::from("a");
        for _ in 0..10 {
            telemetry.record(&key, TierId::L1, Duration::ZERO, 1);
        }
        assert_eq!(telemetry.snapshot(&key).unwrap().frequency, 3);
    }

    #[test]
    fn test_old_events_fall_out_of_window() {
        let telemetry = AccessTelemetry::new(Duration::from_millis(10), 16);
        let key = EntryKey::from("a");
        telemetry.record(&key, TierId::L1, Duration::ZERO, 1);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(telemetry.snapshot(&key).unwrap().frequency, 0);
    }

    #[test]
    fn test_presence_and_keys_in() {
        let telemetry = AccessTelemetry::new(Duration::from_secs(60), 16);
        let a = EntryKey::from("a");
        let b = EntryKey::from("b");
        telemetry.set_present(&a, TierId::L1, true);
        telemetry.set_present(&b, TierId::L1, true);
        telemetry.set_present(&b, TierId::L1, false);

        let in_l1: Vec<EntryKey> = telemetry
            .keys_in(TierId::L1)
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(in_l1, vec![a.clone()]);
        assert!(telemetry.mask(&a).contains(TierId::L1));
        assert!(telemetry.mask(&EntryKey::from("zzz")).is_empty());
    }

    #[test]
    fn test_retention_clock() {
        let telemetry = AccessTelemetry::new(Duration::from_secs(60), 16);
        let key = EntryKey::from("a");
        telemetry.set_present(&key, TierId::L1, true);
        assert!(telemetry.track_retention(&key, TierId::L1, true).is_some());
        std::thread::sleep(Duration::from_millis(5));
        let below = telemetry.track_retention(&key, TierId::L1, true).unwrap();
        assert!(below >= Duration::from_millis(5));
        assert_eq!(telemetry.track_retention(&key, TierId::L1, false), None);
        assert!(telemetry.snapshot(&key).unwrap().below_retention_since[0].is_none());
    }
}
