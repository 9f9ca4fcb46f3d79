//! Logistic placement model
//!
//! Scores each tier with `sigmoid(bias + w · x)` where `x` is the fixed
//! feature vector normalised to comparable ranges. Weights come from
//! configuration, so a trained model can be dropped in without code changes.

use super::{PlacementFeatures, PlacementModel, TierSignal};
use crate::config::LinearModelConfig;

#[derive(Debug, Clone)]
pub struct LinearPlacementModel {
    weights: LinearModelConfig,
}

/// Normalised inputs for one (key, tier) pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    pub frequency: f64,
    pub recency: f64,
    pub size: f64,
    pub latency: f64,
    pub pressure: f64,
}

impl FeatureVector {
    pub fn from_features(features: &PlacementFeatures, signal: &TierSignal) -> Self {
        let recency_secs = features.recency.as_secs_f64();
        let served_ms = features.served_latency.as_secs_f64() * 1000.0;
        let tier_ms = signal.latency.as_secs_f64() * 1000.0;
        Self {
            frequency: (features.frequency as f64).ln_1p(),
            recency: 1.0 / (1.0 + recency_secs),
            size: (features.size as f64 / 1024.0).ln_1p(),
            latency: (served_ms - tier_ms).max(0.0).ln_1p(),
            pressure: signal.pressure.clamp(0.0, 1.0),
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl LinearPlacementModel {
    pub fn new(weights: LinearModelConfig) -> Self {
        Self { weights }
    }

    /// Probability-like score that the key belongs in the tier
    pub fn probability(&self, features: &PlacementFeatures, signal: &TierSignal) -> f64 {
        let x = FeatureVector::from_features(features, signal);
        let w = &self.weights;
        sigmoid(
            w.bias
                + w.frequency * x.frequency
                + w.recency * x.recency
                + w.size * x.size
                + w.latency * x.latency
                + w.pressure * x.pressure,
        )
    }
}

impl PlacementModel for LinearPlacementModel {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn qualifies(&self, features: &PlacementFeatures, signal: &TierSignal) -> bool {
        let p = self.probability(features, signal);
        if signal.present {
            p >= self.weights.demote_below
        } else {
            p >= self.weights.promote_above
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::types::TierId;
    use crate::placement::{features, signal};

    fn model() -> LinearPlacementModel {
        LinearPlacementModel::new(LinearModelConfig::default())
    }

    #[test]
    fn test_more_frequent_scores_higher() {
        let l1 = signal(TierId::L1, 3.0, 1.0);
        let cold = model().probability(&features(1, vec![]), &l1);
        let hot = model().probability(&features(50, vec![]), &l1);
        assert!(hot > cold);
        assert!((0.0..=1.0).contains(&hot));
    }

    #[test]
    fn test_pressure_lowers_score() {
        let mut l1 = signal(TierId::L1, 3.0, 1.0);
        let relaxed = model().probability(&features(5, vec![]), &l1);
        l1.pressure = 1.0;
        let pressured = model().probability(&features(5, vec![]), &l1);
        assert!(pressured < relaxed);
    }

    #[test]
    fn test_hot_key_promoted_stale_key_not() {
        let tiers = vec![signal(TierId::L1, 3.0, 1.0)];
        let decision = model().score(&features(40, tiers.clone()));
        assert!(decision.holds(TierId::L1));

        let mut stale = features(0, tiers);
        stale.recency = Duration::from_secs(3600);
        stale.served_latency = Duration::ZERO;
        let decision = model().score(&stale);
        assert_eq!(decision.targets, vec![TierId::L3]);
    }

    #[test]
    fn test_feature_vector_ranges() {
        let l1 = signal(TierId::L1, 3.0, 1.0);
        let x = FeatureVector::from_features(&features(0, vec![]), &l1);
        assert_eq!(x.frequency, 0.0);
        assert!(x.recency > 0.9);
        assert!(x.latency > 0.0);
    }
}
