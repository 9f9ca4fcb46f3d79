//! Default frequency/recency placement

use super::{PlacementFeatures, PlacementModel, TierSignal};

/// Promote when the windowed access count reaches a tier's promotion
/// threshold; retain while it stays at or above the retention threshold.
///
/// A promotion threshold of zero disables promotion into that tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrequencyRecencyModel;

impl PlacementModel for FrequencyRecencyModel {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn qualifies(&self, features: &PlacementFeatures, signal: &TierSignal) -> bool {
        let frequency = features.frequency as f64;
        if signal.present {
            // Idle keys stop counting once the window has fully passed
            frequency >= signal.retain_threshold
        } else {
            signal.promote_threshold > 0.0 && frequency >= signal.promote_threshold
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::types::TierId;
    use crate::placement::{features, signal};

    #[test]
    fn test_promotes_at_threshold() {
        let tiers = vec![signal(TierId::L1, 3.0, 1.0), signal(TierId::L2, 2.0, 0.5)];
        let decision = FrequencyRecencyModel.score(&features(2, tiers.clone()));
        assert_eq!(decision.targets, vec![TierId::L2, TierId::L3]);

        let decision = FrequencyRecencyModel.score(&features(3, tiers));
        assert_eq!(decision.targets, vec![TierId::L1, TierId::L2, TierId::L3]);
        assert!(decision.demote_from.is_empty());
    }

    #[test]
    fn test_zero_threshold_never_promotes() {
        let decision = FrequencyRecencyModel.score(&features(100, vec![signal(TierId::L1, 0.0, 0.0)]));
        assert_eq!(decision.targets, vec![TierId::L3]);
    }

    #[test]
    fn test_cools_down_before_demoting() {
        let mut l1 = signal(TierId::L1, 3.0, 2.0);
        l1.present = true;

        let decision = FrequencyRecencyModel.score(&features(1, vec![l1.clone()]));
        assert_eq!(decision.cooling, vec![TierId::L1]);
        assert!(decision.holds(TierId::L1));

        l1.below_retention_for = Some(Duration::from_secs(31));
        let decision = FrequencyRecencyModel.score(&features(1, vec![l1.clone()]));
        assert_eq!(decision.demote_from, vec![TierId::L1]);
        assert!(!decision.holds(TierId::L1));

        let decision = FrequencyRecencyModel.score(&features(2, vec![l1]));
        assert!(decision.holds(TierId::L1));
        assert!(decision.cooling.is_empty());
    }

    #[test]
    fn test_zero_cooldown_demotes_immediately() {
        let mut l1 = signal(TierId::L1, 3.0, 2.0);
        l1.present = true;
        l1.cooldown = Duration::ZERO;
        let decision = FrequencyRecencyModel.score(&features(0, vec![l1]));
        assert_eq!(decision.demote_from, vec![TierId::L1]);
    }
}
