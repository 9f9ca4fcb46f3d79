//! Placement optimizer
//!
//! Runs the model over telemetry and turns its decision into a concrete
//! plan. Promotion into a full tier needs a victim: an unprotected key in
//! that tier with a lower access frequency, oldest access first. Without one
//! the promotion is refused. Keys decided earlier in the same
//! [`DecisionCycle`] are protected from being displaced.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use super::telemetry::AccessTelemetry;
use super::{PlacementDecision, PlacementFeatures, PlacementModel, TierSignal};
use crate::memory::types::{EntryKey, TierId};
use crate::tier::{TierDescriptor, TierStats};

/// What the optimizer knows about a cache tier at decision time
#[derive(Debug, Clone)]
pub struct TierContext {
    pub descriptor: TierDescriptor,
    pub stats: TierStats,
    /// Observed median hit latency, if any
    pub latency: Option<Duration>,
    /// False while the tier is marked down
    pub available: bool,
}

impl TierContext {
    pub fn new(descriptor: TierDescriptor, stats: TierStats) -> Self {
        Self {
            descriptor,
            stats,
            latency: None,
            available: true,
        }
    }

    fn pressure(&self) -> f64 {
        self.descriptor.capacity.pressure(&self.stats).min(1.0)
    }

    fn nominal_latency(&self) -> Duration {
        self.latency.unwrap_or(match self.descriptor.id {
            TierId::L1 => Duration::from_micros(2),
            TierId::L2 => Duration::from_micros(500),
            _ => self.descriptor.timeout / 10,
        })
    }
}

/// Shared bookkeeping for decisions made together
#[derive(Debug, Default)]
pub struct DecisionCycle {
    id: u64,
    protected: HashSet<(TierId, EntryKey)>,
    admitted: HashMap<TierId, (u64, u64)>,
}

impl DecisionCycle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_protected(&self, tier: TierId, key: &EntryKey) -> bool {
        self.protected.contains(&(tier, key.clone()))
    }

    fn admit(&mut self, tier: TierId, size: u64) {
        let slot = self.admitted.entry(tier).or_default();
        slot.0 += 1;
        slot.1 += size;
    }

    fn release(&mut self, tier: TierId, size: u64) {
        let slot = self.admitted.entry(tier).or_default();
        slot.0 = slot.0.saturating_sub(1);
        slot.1 = slot.1.saturating_sub(size);
    }

    fn adjusted(&self, tier: TierId, stats: TierStats) -> TierStats {
        let (entries, bytes) = self.admitted.get(&tier).copied().unwrap_or_default();
        TierStats {
            entries: stats.entries + entries,
            bytes: stats.bytes + bytes,
            evictions: stats.evictions,
        }
    }
}

/// Concrete actions derived from a decision
#[derive(Debug, Clone)]
pub struct PlacementPlan {
    pub decision: PlacementDecision,
    /// Tiers to copy the key into, fastest first
    pub promote: Vec<TierId>,
    /// Keys to remove to make room, per tier
    pub displaced: Vec<(TierId, EntryKey)>,
    /// Promotions refused for lack of room
    pub refused: Vec<TierId>,
    /// Tiers to drop the key from
    pub demote: Vec<TierId>,
}

impl PlacementPlan {
    pub fn is_noop(&self) -> bool {
        self.promote.is_empty() && self.demote.is_empty() && self.displaced.is_empty()
    }
}

#[derive(Debug)]
pub struct PlacementOptimizer {
    model: Arc<dyn PlacementModel>,
    telemetry: Arc<AccessTelemetry>,
    cycles: AtomicU64,
}

impl PlacementOptimizer {
    pub fn new(model: Arc<dyn PlacementModel>, telemetry: Arc<AccessTelemetry>) -> Self {
        Self {
            model,
            telemetry,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn telemetry(&self) -> &Arc<AccessTelemetry> {
        &self.telemetry
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    pub fn begin_cycle(&self) -> DecisionCycle {
        DecisionCycle {
            id: self.cycles.fetch_add(1, Ordering::Relaxed) + 1,
            ..Default::default()
        }
    }

    /// Assemble the model inputs for `key`; `None` if it has no telemetry
    pub fn features(&self, key: &EntryKey, tiers: &[TierContext]) -> Option<PlacementFeatures> {
        let snapshot = self.telemetry.snapshot(key)?;
        let signals = tiers
            .iter()
            .filter(|t| t.descriptor.id != TierId::L3 && t.descriptor.id != TierId::L4)
            .map(|t| {
                let id = t.descriptor.id;
                let slot = id.bit().trailing_zeros() as usize;
                TierSignal {
                    tier: id,
                    latency: t.nominal_latency(),
                    pressure: t.pressure(),
                    promote_threshold: t.descriptor.promote_threshold,
                    retain_threshold: t.descriptor.retain_threshold,
                    cooldown: t.descriptor.cooldown,
                    present: snapshot.mask.contains(id),
                    below_retention_for: snapshot
                        .below_retention_since
                        .get(slot)
                        .copied()
                        .flatten()
                        .map(|since| since.elapsed()),
                }
            })
            .collect();
        Some(PlacementFeatures {
            key: key.clone(),
            frequency: snapshot.frequency,
            recency: snapshot.since_last_access,
            size: snapshot.size,
            tier_mask: snapshot.mask,
            served_latency: snapshot.served_latency,
            tiers: signals,
        })
    }

    /// Score `key` and resolve capacity for its promotions
    pub fn plan(
        &self,
        key: &EntryKey,
        tiers: &[TierContext],
        cycle: &mut DecisionCycle,
    ) -> Option<PlacementPlan> {
        let features = self.features(key, tiers)?;
        let decision = self.model.score(&features);

        for signal in features.tiers.iter().filter(|s| s.present) {
            let below =
                decision.cooling.contains(&signal.tier) || decision.demote_from.contains(&signal.tier);
            self.telemetry.track_retention(key, signal.tier, below);
        }

        let mut plan = PlacementPlan {
            promote: Vec::new(),
            displaced: Vec::new(),
            refused: Vec::new(),
            demote: decision
                .demote_from
                .iter()
                .copied()
                .filter(|t| features.tier_mask.contains(*t))
                .collect(),
            decision,
        };

        for tier in plan.decision.targets.iter().copied() {
            if tier != TierId::L3 {
                cycle.protected.insert((tier, key.clone()));
            }
        }

        for tier in plan.decision.promotions(features.tier_mask) {
            let Some(context) = tiers.iter().find(|t| t.descriptor.id == tier) else {
                continue;
            };
            if !context.available {
                continue;
            }
            let stats = cycle.adjusted(tier, context.stats);
            if !context.descriptor.capacity.is_full(&stats) {
                cycle.admit(tier, features.size);
                plan.promote.push(tier);
                continue;
            }
            match self.pick_victim(key, tier, features.frequency, cycle) {
                Some((victim, victim_size)) => {
                    debug!(key = %key, victim = %victim, tier = %tier, "displacing colder key");
                    cycle.protected.insert((tier, victim.clone()));
                    cycle.release(tier, victim_size);
                    cycle.admit(tier, features.size);
                    plan.displaced.push((tier, victim));
                    plan.promote.push(tier);
                }
                None => {
                    debug!(key = %key, tier = %tier, "promotion refused, tier full");
                    cycle.protected.remove(&(tier, key.clone()));
                    plan.refused.push(tier);
                }
            }
        }

        Some(plan)
    }

    /// Oldest-accessed key in `tier` colder than `frequency` and not
    /// protected by this cycle
    fn pick_victim(
        &self,
        key: &EntryKey,
        tier: TierId,
        frequency: u64,
        cycle: &DecisionCycle,
    ) -> Option<(EntryKey, u64)> {
        let mut candidates: Vec<_> = self
            .telemetry
            .keys_in(tier)
            .into_iter()
            .filter(|(k, _, f)| k != key && *f < frequency && !cycle.is_protected(tier, k))
            .collect();
        candidates.sort_by_key(|(_, last_access, _)| *last_access);
        let (victim, _, _) = candidates.into_iter().next()?;
        let size = self
            .telemetry
            .snapshot(&victim)
            .map(|s| s.size)
            .unwrap_or_default();
        Some((victim, size))
    }
}
