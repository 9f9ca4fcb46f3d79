//! Metrics collection
//!
//! Lock-free counters per tier plus a bounded latency reservoir. The
//! manager records into a shared `MetricsCollector`; `snapshot()` produces a
//! serializable pull-based view for external collectors and the placement
//! optimizer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::memory::types::TierId;

/// Latency samples kept per tier
pub const RESERVOIR_SIZE: usize = 1024;

#[derive(Debug, Default)]
struct LatencyReservoir {
    samples_us: VecDeque<u64>,
}

impl LatencyReservoir {
    fn record(&mut self, micros: u64) {
        if self.samples_us.len() >= RESERVOIR_SIZE {
            self.samples_us.pop_front();
        }
        self.samples_us.push_back(micros);
    }

    fn percentiles(&self) -> (u64, u64, u64) {
        if self.samples_us.is_empty() {
            return (0, 0, 0);
        }
        let mut sorted: Vec<u64> = self.samples_us.iter().copied().collect();
        sorted.sort_unstable();
        (
            percentile(&sorted, 50),
            percentile(&sorted, 95),
            percentile(&sorted, 99),
        )
    }
}

fn percentile(sorted: &[u64], pct: usize) -> u64 {
    let idx = (sorted.len() * pct).div_ceil(100).saturating_sub(1);
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    unavailable: AtomicU64,
    timeouts: AtomicU64,
    evictions: AtomicU64,
    promotions: AtomicU64,
    promotions_refused: AtomicU64,
    demotions: AtomicU64,
    latency: Mutex<LatencyReservoir>,
}

/// Shared metrics sink
#[derive(Debug)]
pub struct MetricsCollector {
    tiers: [TierCounters; 4],
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    searches: AtomicU64,
    not_found: AtomicU64,
    deadline_exceeded: AtomicU64,
    stale_rejected: AtomicU64,
    jobs_submitted: AtomicU64,
    jobs_dropped: AtomicU64,
    repairs_pending: AtomicI64,
    write_behind_pending: AtomicI64,
    expired_purged: AtomicU64,
    started: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn index(tier: TierId) -> usize {
    match tier {
        TierId::L1 => 0,
        TierId::L2 => 1,
        TierId::L3 => 2,
        TierId::L4 => 3,
    }
}

fn micros(latency: Duration) -> u64 {
    u64::try_from(latency.as_micros()).unwrap_or(u64::MAX)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tiers: Default::default(),
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            searches: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            deadline_exceeded: AtomicU64::new(0),
            stale_rejected: AtomicU64::new(0),
            jobs_submitted: AtomicU64::new(0),
            jobs_dropped: AtomicU64::new(0),
            repairs_pending: AtomicI64::new(0),
            write_behind_pending: AtomicI64::new(0),
            expired_purged: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    fn tier(&self, tier: TierId) -> &TierCounters {
        &self.tiers[index(tier)]
    }

    fn record_latency(&self, tier: TierId, latency: Duration) {
        let mut reservoir = self
            .tier(tier)
            .latency
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        reservoir.record(micros(latency));
    }

    pub fn record_hit(&self, tier: TierId, latency: Duration) {
        self.tier(tier).hits.fetch_add(1, Ordering::Relaxed);
        self.record_latency(tier, latency);
    }

    pub fn record_miss(&self, tier: TierId, latency: Duration) {
        self.tier(tier).misses.fetch_add(1, Ordering::Relaxed);
        self.record_latency(tier, latency);
    }

    pub fn record_unavailable(&self, tier: TierId) {
        self.tier(tier).unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier_timeout(&self, tier: TierId) {
        self.tier(tier).timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, tier: TierId, count: u64) {
        self.tier(tier).evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_promotion(&self, tier: TierId) {
        self.tier(tier).promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion_refused(&self, tier: TierId) {
        self.tier(tier)
            .promotions_refused
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self, tier: TierId) {
        self.tier(tier).demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deadline_exceeded(&self) {
        self.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_rejected(&self) {
        self.stale_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_dropped(&self) {
        self.jobs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired_purged(&self, count: u64) {
        self.expired_purged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_repairs_pending(&self, pending: usize) {
        self.repairs_pending
            .store(i64::try_from(pending).unwrap_or(i64::MAX), Ordering::Relaxed);
    }

    pub fn set_write_behind_pending(&self, pending: usize) {
        self.write_behind_pending
            .store(i64::try_from(pending).unwrap_or(i64::MAX), Ordering::Relaxed);
    }

    pub fn hits(&self, tier: TierId) -> u64 {
        self.tier(tier).hits.load(Ordering::Relaxed)
    }

    pub fn jobs_dropped(&self) -> u64 {
        self.jobs_dropped.load(Ordering::Relaxed)
    }

    /// Median observed latency of a tier, if any samples exist
    pub fn median_latency(&self, tier: TierId) -> Option<Duration> {
        let reservoir = self.tier(tier).latency.lock().unwrap_or_else(|e| e.into_inner());
        if reservoir.samples_us.is_empty() {
            return None;
        }
        Some(Duration::from_micros(reservoir.percentiles().0))
    }

    pub fn tier_snapshot(&self, tier: TierId) -> TierMetricsSnapshot {
        let counters = self.tier(tier);
        let (p50_us, p95_us, p99_us, samples) = {
            let reservoir = counters.latency.lock().unwrap_or_else(|e| e.into_inner());
            let (p50, p95, p99) = reservoir.percentiles();
            (p50, p95, p99, reservoir.samples_us.len())
        };
        TierMetricsSnapshot {
            tier,
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            unavailable: counters.unavailable.load(Ordering::Relaxed),
            timeouts: counters.timeouts.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            promotions: counters.promotions.load(Ordering::Relaxed),
            promotions_refused: counters.promotions_refused.load(Ordering::Relaxed),
            demotions: counters.demotions.load(Ordering::Relaxed),
            p50_us,
            p95_us,
            p99_us,
            samples,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            stale_rejected: self.stale_rejected.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_dropped: self.jobs_dropped.load(Ordering::Relaxed),
            repairs_pending: self.repairs_pending.load(Ordering::Relaxed).max(0) as u64,
            write_behind_pending: self.write_behind_pending.load(Ordering::Relaxed).max(0) as u64,
            expired_purged: self.expired_purged.load(Ordering::Relaxed),
            tiers: TierId::ALL.iter().map(|t| self.tier_snapshot(*t)).collect(),
        }
    }
}

/// Point-in-time counters for one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierMetricsSnapshot {
    pub tier: TierId,
    pub hits: u64,
    pub misses: u64,
    pub unavailable: u64,
    pub timeouts: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub promotions_refused: u64,
    pub demotions: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub samples: usize,
}

impl TierMetricsSnapshot {
    /// Hit rate as a fraction of lookups that reached this tier
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

/// Pull-based metrics view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
    pub searches: u64,
    pub not_found: u64,
    pub deadline_exceeded: u64,
    pub stale_rejected: u64,
    pub jobs_submitted: u64,
    pub jobs_dropped: u64,
    pub repairs_pending: u64,
    pub write_behind_pending: u64,
    pub expired_purged: u64,
    pub tiers: Vec<TierMetricsSnapshot>,
}

impl MetricsSnapshot {
    pub fn tier(&self, tier: TierId) -> Option<&TierMetricsSnapshot> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss_counts() {
        let metrics = MetricsCollector::new();
        metrics.record_hit(TierId::L1, Duration::from_micros(10));
        metrics.record_hit(TierId::L1, Duration::from_micros(20));
        metrics.record_miss(TierId::L1, Duration::from_micros(5));
        metrics.record_hit(TierId::L3, Duration::from_millis(2));

        let snapshot = metrics.snapshot();
        let l1 = snapshot.tier(TierId::L1).unwrap();
        assert_eq!(l1.hits, 2);
        assert_eq!(l1.misses, 1);
        assert!((l1.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.tier(TierId::L3).unwrap().hits, 1);
        assert_eq!(snapshot.tier(TierId::L2).unwrap().hit_rate(), 0.0);
    }

    #[test]
    fn test_percentiles() {
        let metrics = MetricsCollector::new();
        for us in 1..=100 {
            metrics.record_hit(TierId::L2, Duration::from_micros(us));
        }
        let l2 = metrics.tier_snapshot(TierId::L2);
        assert_eq!(l2.p50_us, 50);
        assert_eq!(l2.p95_us, 95);
        assert_eq!(l2.p99_us, 99);
        assert_eq!(metrics.median_latency(TierId::L2), Some(Duration::from_micros(50)));
        assert_eq!(metrics.median_latency(TierId::L1), None);
    }

    #[test]
    fn test_reservoir_is_bounded() {
        let metrics = MetricsCollector::new();
        for _ in 0..(RESERVOIR_SIZE + 500) {
            metrics.record_hit(TierId::L1, Duration::from_micros(1));
        }
        assert_eq!(metrics.tier_snapshot(TierId::L1).samples, RESERVOIR_SIZE);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsCollector::new();
        metrics.record_job_dropped();
        metrics.set_repairs_pending(3);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["jobs_dropped"], 1);
        assert_eq!(json["repairs_pending"], 3);
        assert_eq!(json["tiers"][0]["tier"], "l1");
    }
}
