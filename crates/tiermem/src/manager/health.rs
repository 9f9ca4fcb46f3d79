//! Tier health tracking
//!
//! A tier that fails with `TierUnavailable` is skipped until its re-probe
//! time; the first call after that acts as the probe. No tier stays skipped
//! without being retried.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::memory::types::TierId;
use crate::metrics::MetricsSnapshot;

#[derive(Debug, Clone)]
struct TierState {
    down_since: Instant,
    next_probe: Instant,
    reason: String,
}

#[derive(Debug)]
pub struct TierHealth {
    down: Mutex<HashMap<TierId, TierState>>,
    reprobe: Duration,
}

impl TierHealth {
    pub fn new(reprobe: Duration) -> Self {
        Self {
            down: Mutex::new(HashMap::new()),
            reprobe,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TierId, TierState>> {
        self.down.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True while a down tier is inside its back-off window
    pub fn should_skip(&self, tier: TierId) -> bool {
        self.lock()
            .get(&tier)
            .is_some_and(|s| Instant::now() < s.next_probe)
    }

    pub fn is_down(&self, tier: TierId) -> bool {
        self.lock().contains_key(&tier)
    }

    pub fn mark_down(&self, tier: TierId, reason: impl Into<String>) {
        let reason = reason.into();
        let now = Instant::now();
        let mut down = self.lock();
        match down.get_mut(&tier) {
            Some(state) => {
                state.next_probe = now + self.reprobe;
                state.reason = reason;
            }
            None => {
                warn!("Tier {tier} marked unavailable: {reason}");
                down.insert(
                    tier,
                    TierState {
                        down_since: now,
                        next_probe: now + self.reprobe,
                        reason,
                    },
                );
            }
        }
    }

    pub fn mark_up(&self, tier: TierId) {
        if let Some(state) = self.lock().remove(&tier) {
            info!(
                "Tier {tier} recovered after {}ms",
                state.down_since.elapsed().as_millis()
            );
        }
    }

    pub fn reason(&self, tier: TierId) -> Option<String> {
        self.lock().get(&tier).map(|s| s.reason.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierStatus {
    Up,
    Unavailable,
}

/// Probe result for one tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierHealthReport {
    pub tier: TierId,
    pub role: String,
    pub status: TierStatus,
    pub probe_ms: u64,
    pub entries: Option<u64>,
    pub bytes: Option<u64>,
    pub evictions: Option<u64>,
    pub error: Option<String>,
}

/// Output of `UnifiedMemoryManager::health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// True when the durable tier is reachable
    pub healthy: bool,
    pub placement_model: String,
    pub tiers: Vec<TierHealthReport>,
    pub repairs_pending: usize,
    pub write_behind_pending: usize,
    pub tombstones: usize,
    pub metrics: MetricsSnapshot,
}

impl HealthReport {
    pub fn tier(&self, tier: TierId) -> Option<&TierHealthReport> {
        self.tiers.iter().find(|t| t.tier == tier)
    }
}
