//! Sharded per-key write locks
//!
//! Writers of the same key serialize on the shard its hash lands in.
//! Multi-key callers lock shards in ascending index order so they can never
//! deadlock against each other or single-key callers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::memory::types::EntryKey;

#[derive(Debug)]
pub struct KeyLocks {
    shards: Vec<Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_of(&self, key: &EntryKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    pub async fn lock(&self, key: &EntryKey) -> OwnedMutexGuard<()> {
        self.shards[self.shard_of(key)].clone().lock_owned().await
    }

    /// Lock every shard touched by `keys`, in shard order
    pub async fn lock_many<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a EntryKey>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mut shards: Vec<usize> = keys.into_iter().map(|k| self.shard_of(k)).collect();
        shards.sort_unstable();
        shards.dedup();
        let mut guards = Vec::with_capacity(shards.len());
        for shard in shards {
            guards.push(self.shards[shard].clone().lock_owned().await);
        }
        guards
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(KeyLocks::new(8));
        let key = EntryKey::from("a");
        let guard = locks.lock(&key).await;

        let contender = {
            let locks = locks.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_many_dedups_shards() {
        let locks = KeyLocks::new(1);
        let a = EntryKey::from("a");
        let b = EntryKey::from("b");
        let guards = locks.lock_many([&a, &b, &a]).await;
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn test_shard_is_stable() {
        let locks = KeyLocks::new(64);
        let key = EntryKey::new("ns", "k");
        assert_eq!(locks.shard_of(&key), locks.shard_of(&key.clone()));
        assert!(locks.shard_of(&key) < locks.shard_count());
    }
}
