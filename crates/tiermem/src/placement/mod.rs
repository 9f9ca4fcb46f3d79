//! Placement: which tiers should hold a copy of a key
//!
//! A [`PlacementModel`] turns a fixed feature set into a [`PlacementDecision`].
//! The [`optimizer::PlacementOptimizer`] feeds it from the access telemetry
//! and applies capacity backpressure to its output.

pub mod heuristic;
pub mod linear;
pub mod optimizer;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{PlacementConfig, PlacementModelKind};
use crate::memory::types::{EntryKey, TierId, TierMask};

pub use heuristic::FrequencyRecencyModel;
pub use linear::LinearPlacementModel;
pub use optimizer::{DecisionCycle, PlacementOptimizer, PlacementPlan, TierContext};
pub use telemetry::{AccessTelemetry, KeySnapshot};

/// Per-tier inputs to a placement decision
#[derive(Debug, Clone)]
pub struct TierSignal {
    pub tier: TierId,
    /// Typical latency of a hit in this tier
    pub latency: Duration,
    /// Capacity pressure, 0.0 (empty or unbounded) to 1.0 (full)
    pub pressure: f64,
    pub promote_threshold: f64,
    pub retain_threshold: f64,
    pub cooldown: Duration,
    /// Whether the tier currently holds a copy
    pub present: bool,
    /// How long the key has been judged below retention in this tier
    pub below_retention_for: Option<Duration>,
}

/// The fixed feature set every model consumes
#[derive(Debug, Clone)]
pub struct PlacementFeatures {
    pub key: EntryKey,
    /// Accesses in the trailing window
    pub frequency: u64,
    /// Time since the last access
    pub recency: Duration,
    pub size: u64,
    pub tier_mask: TierMask,
    /// Mean latency of the tiers that served the windowed accesses
    pub served_latency: Duration,
    /// Cache tiers ahead of the durable tier, fastest first
    pub tiers: Vec<TierSignal>,
}

/// Where a key should live after its next access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementDecision {
    pub key: EntryKey,
    /// Tiers that should hold a copy, fastest first; always ends with L3
    pub targets: Vec<TierId>,
    /// Tiers the key should be removed from
    pub demote_from: Vec<TierId>,
    /// Tiers still holding the key while it cools down below retention
    pub cooling: Vec<TierId>,
}

impl PlacementDecision {
    pub fn holds(&self, tier: TierId) -> bool {
        self.targets.contains(&tier)
    }

    /// Targets that do not yet hold a copy
    pub fn promotions(&self, mask: TierMask) -> Vec<TierId> {
        self.targets
            .iter()
            .copied()
            .filter(|t| *t != TierId::L3 && !mask.contains(*t))
            .collect()
    }
}

/// Scoring strategy; swappable without touching the manager
pub trait PlacementModel: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether the key earns a copy in the tier described by `signal`.
    /// For a tier already holding the key this is the retention test,
    /// otherwise the promotion test.
    fn qualifies(&self, features: &PlacementFeatures, signal: &TierSignal) -> bool;

    fn score(&self, features: &PlacementFeatures) -> PlacementDecision {
        let mut decision = PlacementDecision {
            key: features.key.clone(),
            targets: Vec::new(),
            demote_from: Vec::new(),
            cooling: Vec::new(),
        };
        for signal in &features.tiers {
            if self.qualifies(features, signal) {
                decision.targets.push(signal.tier);
            } else if signal.present {
                let below = signal.below_retention_for.unwrap_or(Duration::ZERO);
                if below >= signal.cooldown {
                    decision.demote_from.push(signal.tier);
                } else {
                    decision.targets.push(signal.tier);
                    decision.cooling.push(signal.tier);
                }
            }
        }
        decision.targets.push(TierId::L3);
        decision
    }
}

/// Build the model selected in configuration
pub fn model_from_config(config: &PlacementConfig) -> Arc<dyn PlacementModel> {
    match config.model {
        PlacementModelKind::Heuristic => Arc::new(FrequencyRecencyModel),
        PlacementModelKind::Linear => Arc::new(LinearPlacementModel::new(config.linear.clone())),
    }
}

#[cfg(test)]
pub(crate) fn signal(tier: TierId, promote: f64, retain: f64) -> TierSignal {
    TierSignal {
        tier,
        latency: match tier {
            TierId::L1 => Duration::from_micros(2),
            TierId::L2 => Duration::from_micros(500),
            _ => Duration::from_millis(2),
        },
        pressure: 0.0,
        promote_threshold: promote,
        retain_threshold: retain,
        cooldown: Duration::from_secs(30),
        present: false,
        below_retention_for: None,
    }
}

#[cfg(test)]
pub(crate) fn features(frequency: u64, tiers: Vec<TierSignal>) -> PlacementFeatures {
    PlacementFeatures {
        key: EntryKey::from("k"),
        frequency,
        recency: Duration::from_millis(10),
        size: 64,
        tier_mask: TierMask::of(&[TierId::L3]),
        served_latency: Duration::from_millis(2),
        tiers,
    }
}
