//! Tier registry and factory
//!
//! `TierRegistry` is built once, validated, and never mutated afterwards.
//! The manager receives it by value at construction time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::shared::RetryPolicy;
use super::{DurableTier, LocalTier, SharedTier, SimilarityStore, SimilarityTier, TierDescriptor, TierStore};
use crate::config::Config;
use crate::error::{MemoryError, Result};
use crate::memory::types::TierId;

pub struct TierRegistry {
    chain: Vec<Arc<dyn TierStore>>,
    durable: Arc<dyn TierStore>,
    similarity: Option<Arc<dyn SimilarityStore>>,
}

impl std::fmt::Debug for TierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierRegistry")
            .field("chain", &self.chain.iter().map(|t| t.id()).collect::<Vec<_>>())
            .field("similarity", &self.similarity.is_some())
            .finish()
    }
}

impl TierRegistry {
    pub fn builder() -> TierRegistryBuilder {
        TierRegistryBuilder::default()
    }

    /// Construct every configured tier.
    ///
    /// An unreachable durable or similarity store is a `Config` error: the
    /// manager must not start in that state.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            MemoryError::Config(format!(
                "Failed to create data directory {}: {e}",
                config.data_dir.display()
            ))
        })?;

        let tiers = &config.tiers;
        let mut builder = Self::builder().tier(Arc::new(LocalTier::new(tiers.l1.descriptor())));

        if tiers.l2.enabled {
            let retry = RetryPolicy {
                max_retries: tiers.l2.retries,
                base_delay: Duration::from_millis(tiers.l2.backoff_base_ms),
            };
            let shared = SharedTier::new(&tiers.l2.url, tiers.l2.descriptor(), retry)?;
            info!("L2 shared cache at {}", shared.base_url());
            builder = builder.tier(Arc::new(shared));
        }

        let url = config.durable_url();
        let durable = DurableTier::connect(&url, tiers.l3.descriptor(), tiers.l3.max_connections)
            .await
            .map_err(|e| MemoryError::Config(format!("Durable tier unreachable at {url}: {e}")))?;
        info!("L3 durable store at {url}");
        builder = builder.tier(Arc::new(durable));

        if tiers.l4.enabled {
            let path = config.data_dir.join(&tiers.l4.directory);
            let similarity = SimilarityTier::open(
                &path,
                &tiers.l4.table,
                tiers.l4.descriptor(),
                tiers.l4.dimension,
                tiers.l4.overfetch,
            )
            .await
            .map_err(|e| {
                MemoryError::Config(format!(
                    "Similarity tier unavailable at {}: {e}",
                    path.display()
                ))
            })?;
            info!("L4 similarity store at {}", path.display());
            builder = builder.similarity(Arc::new(similarity));
        }

        builder.build()
    }

    /// Key/value tiers, fastest first
    pub fn chain(&self) -> &[Arc<dyn TierStore>] {
        &self.chain
    }

    /// Tiers ahead of the durable tier
    pub fn fast_tiers(&self) -> impl Iterator<Item = &Arc<dyn TierStore>> {
        self.chain.iter().filter(|t| t.id() != TierId::L3)
    }

    pub fn durable(&self) -> &Arc<dyn TierStore> {
        &self.durable
    }

    pub fn similarity(&self) -> Option<&Arc<dyn SimilarityStore>> {
        self.similarity.as_ref()
    }

    pub fn get(&self, id: TierId) -> Option<&Arc<dyn TierStore>> {
        self.chain.iter().find(|t| t.id() == id)
    }

    pub fn descriptor(&self, id: TierId) -> Option<&TierDescriptor> {
        if id == TierId::L4 {
            return self.similarity.as_ref().map(|s| s.descriptor());
        }
        self.get(id).map(|t| t.descriptor())
    }

    /// Every configured tier id, including L4
    pub fn ids(&self) -> Vec<TierId> {
        let mut ids: Vec<TierId> = self.chain.iter().map(|t| t.id()).collect();
        if self.similarity.is_some() {
            ids.push(TierId::L4);
        }
        ids
    }
}

#[derive(Default)]
pub struct TierRegistryBuilder {
    chain: Vec<Arc<dyn TierStore>>,
    similarity: Option<Arc<dyn SimilarityStore>>,
}

impl TierRegistryBuilder {
    /// Add a key/value tier (L1, L2 or L3)
    pub fn tier(mut self, tier: Arc<dyn TierStore>) -> Self {
        self.chain.push(tier);
        self
    }

    pub fn similarity(mut self, tier: Arc<dyn SimilarityStore>) -> Self {
        self.similarity = Some(tier);
        self
    }

    pub fn build(mut self) -> Result<TierRegistry> {
        let mut seen = HashSet::new();
        for tier in &self.chain {
            if tier.id() == TierId::L4 {
                return Err(MemoryError::Config(
                    "L4 must be registered as the similarity tier".to_string(),
                ));
            }
            if !seen.insert(tier.id()) {
                return Err(MemoryError::Config(format!(
                    "Tier {} registered twice",
                    tier.id()
                )));
            }
        }
        if let Some(similarity) = &self.similarity {
            if similarity.id() != TierId::L4 {
                return Err(MemoryError::Config(format!(
                    "Similarity tier must be L4, got {}",
                    similarity.id()
                )));
            }
        }

        let durable = self
            .chain
            .iter()
            .find(|t| t.id() == TierId::L3)
            .cloned()
            .ok_or_else(|| MemoryError::Config("A durable L3 tier is required".to_string()))?;

        self.chain.sort_by_key(|t| t.descriptor().ordinal);
        Ok(TierRegistry {
            chain: self.chain,
            durable,
            similarity: self.similarity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryTier;

    #[test]
    fn test_requires_durable_tier() {
        let result = TierRegistry::builder()
            .tier(Arc::new(LocalTier::with_max_entries(10)))
            .build();
        assert!(matches!(result, Err(MemoryError::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_tiers() {
        let result = TierRegistry::builder()
            .tier(Arc::new(LocalTier::with_max_entries(10)))
            .tier(Arc::new(LocalTier::with_max_entries(10)))
            .tier(Arc::new(MemoryTier::durable()))
            .build();
        assert!(matches!(result, Err(MemoryError::Config(msg)) if msg.contains("twice")));
    }

    #[test]
    fn test_chain_sorted_by_ordinal() {
        let registry = TierRegistry::builder()
            .tier(Arc::new(MemoryTier::durable()))
            .tier(Arc::new(MemoryTier::new(TierId::L2)))
            .tier(Arc::new(LocalTier::with_max_entries(10)))
            .build()
            .unwrap();
        let ids: Vec<TierId> = registry.chain().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![TierId::L1, TierId::L2, TierId::L3]);
        assert_eq!(registry.durable().id(), TierId::L3);
        assert_eq!(
            registry.fast_tiers().map(|t| t.id()).collect::<Vec<_>>(),
            vec![TierId::L1, TierId::L2]
        );
        assert_eq!(registry.ids(), vec![TierId::L1, TierId::L2, TierId::L3]);
    }
}
