//! Similarity tier tests against a LanceDB table in a temp directory

use bytes::Bytes;
use chrono::{Duration, Utc};
use tempfile::TempDir;

use tiermem::error::MemoryError;
use tiermem::memory::{Durability, EntryKey, MemoryEntry, Metadata, TierId};
use tiermem::testing::MockEmbedder;
use tiermem::tier::{
    EvictionHint, EvictionPolicy, SearchFilter, SimilarityStore, SimilarityTier, TierDescriptor,
    TierStore,
};

const DIMENSION: usize = 8;

async fn open() -> (TempDir, SimilarityTier) {
    let dir = tempfile::tempdir().unwrap();
    let tier = SimilarityTier::open(
        dir.path(),
        "entries",
        TierDescriptor::new(TierId::L4),
        DIMENSION,
        4,
    )
    .await
    .unwrap();
    (dir, tier)
}

fn vector_entry(key: EntryKey, embedding: Vec<f32>, sequence: u64) -> MemoryEntry {
    let mut metadata = Metadata::new();
    metadata.insert("searchable".to_string(), "true".to_string());
    MemoryEntry::new(key, Bytes::from_static(b"payload"), sequence, Utc::now())
        .with_metadata(metadata)
        .with_embedding(embedding)
}

fn tagged(entry: MemoryEntry, tag: &str, value: &str) -> MemoryEntry {
    let mut metadata = entry.metadata.clone();
    metadata.insert(tag.to_string(), value.to_string());
    entry.with_metadata(metadata)
}

mod storage {
    use super::*;

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let (_dir, tier) = open().await;
        let embedder = MockEmbedder::default();
        let key = EntryKey::from("doc");

        tier.set(&vector_entry(key.clone(), embedder.axis(0), 1))
            .await
            .unwrap();
        tier.set(&vector_entry(key.clone(), embedder.axis(1), 2))
            .await
            .unwrap();

        let stored = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.sequence, 2);
        assert_eq!(stored.embedding, Some(embedder.axis(1)));
        assert_eq!(tier.approximate_size().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_stale_upsert_is_rejected() {
        let (_dir, tier) = open().await;
        let embedder = MockEmbedder::default();
        let key = EntryKey::from("doc");
        tier.set(&vector_entry(key.clone(), embedder.axis(0), 5))
            .await
            .unwrap();

        let err = tier
            .set(&vector_entry(key.clone(), embedder.axis(1), 4))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::StaleWriteRejected { stored: 5, .. }));
        let stored = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(stored.embedding, Some(embedder.axis(0)));
    }

    #[tokio::test]
    async fn test_wrong_dimension_is_rejected() {
        let (_dir, tier) = open().await;
        let err = tier
            .set(&vector_entry(EntryKey::from("doc"), vec![1.0, 0.0], 1))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_embedding_is_rejected() {
        let (_dir, tier) = open().await;
        let entry = MemoryEntry::new(EntryKey::from("doc"), "payload", 1, Utc::now());
        assert!(matches!(
            tier.set(&entry).await,
            Err(MemoryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_dimension_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            SimilarityTier::open(dir.path(), "entries", TierDescriptor::new(TierId::L4), 0, 4).await;
        assert!(matches!(result, Err(MemoryError::Config(_))));
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let (_dir, tier) = open().await;
        let embedder = MockEmbedder::default();
        let key = EntryKey::new("notes", "it's quoted");
        tier.set(&vector_entry(key.clone(), embedder.axis(2), 1))
            .await
            .unwrap();

        assert!(tier.exists(&key).await.unwrap());
        assert!(tier.delete(&key).await.unwrap());
        assert!(!tier.exists(&key).await.unwrap());
        assert!(!tier.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_table_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let embedder = MockEmbedder::default();
        {
            let tier = SimilarityTier::open(
                dir.path(),
                "entries",
                TierDescriptor::new(TierId::L4),
                DIMENSION,
                4,
            )
            .await
            .unwrap();
            tier.set(&vector_entry(EntryKey::from("doc"), embedder.axis(0), 1))
                .await
                .unwrap();
        }

        let tier = SimilarityTier::open(
            dir.path(),
            "entries",
            TierDescriptor::new(TierId::L4),
            DIMENSION,
            4,
        )
        .await
        .unwrap();
        assert!(tier.exists(&EntryKey::from("doc")).await.unwrap());
    }
}

mod search {
    use super::*;

    async fn seeded() -> (TempDir, SimilarityTier, MockEmbedder) {
        let (dir, tier) = open().await;
        let embedder = MockEmbedder::default();
        for (i, name) in ["zero", "one", "two", "three"].iter().enumerate() {
            let entry = vector_entry(EntryKey::new("docs", *name), embedder.axis(i), 1);
            tier.set(&tagged(entry, "parity", if i % 2 == 0 { "even" } else { "odd" }))
                .await
                .unwrap();
        }
        let other = vector_entry(EntryKey::new("other", "zero"), embedder.axis(0), 1);
        tier.set(&other).await.unwrap();
        (dir, tier, embedder)
    }

    #[tokio::test]
    async fn test_nearest_first() {
        let (_dir, tier, embedder) = seeded().await;
        let hits = tier
            .search(&embedder.axis(1), 2, &SearchFilter::new().with_namespace("docs"))
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.key, EntryKey::new("docs", "one"));
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_namespace_filter() {
        let (_dir, tier, embedder) = seeded().await;
        let hits = tier
            .search(&embedder.axis(0), 10, &SearchFilter::new().with_namespace("other"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.key, EntryKey::new("other", "zero"));
    }

    #[tokio::test]
    async fn test_tag_filter() {
        let (_dir, tier, embedder) = seeded().await;
        let hits = tier
            .search(&embedder.axis(1), 10, &SearchFilter::new().with_tag("parity", "even"))
            .await
            .unwrap();

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.entry.metadata.get("parity").map(String::as_str) == Some("even")));
    }

    #[tokio::test]
    async fn test_max_distance_filter() {
        let (_dir, tier, embedder) = seeded().await;
        let hits = tier
            .search(
                &embedder.axis(3),
                10,
                &SearchFilter::new()
                    .with_namespace("docs")
                    .with_max_distance(0.01),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.key, EntryKey::new("docs", "three"));
    }

    #[tokio::test]
    async fn test_zero_k_and_bad_query() {
        let (_dir, tier, embedder) = seeded().await;
        assert!(tier
            .search(&embedder.axis(0), 0, &SearchFilter::new())
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            tier.search(&[1.0], 3, &SearchFilter::new()).await,
            Err(MemoryError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_deleted_entry_not_returned() {
        let (_dir, tier, embedder) = seeded().await;
        tier.delete(&EntryKey::new("docs", "two")).await.unwrap();
        let hits = tier
            .search(&embedder.axis(2), 10, &SearchFilter::new().with_namespace("docs"))
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.entry.key != EntryKey::new("docs", "two")));
        assert_eq!(hits.len(), 3);
    }
}

mod maintenance {
    use super::*;

    #[tokio::test]
    async fn test_purge_expired() {
        let (_dir, tier) = open().await;
        let embedder = MockEmbedder::default();
        let now = Utc::now();
        tier.set(
            &vector_entry(EntryKey::from("old"), embedder.axis(0), 1)
                .with_ttl(now - Duration::seconds(5)),
        )
        .await
        .unwrap();
        tier.set(&vector_entry(EntryKey::from("live"), embedder.axis(1), 1))
            .await
            .unwrap();

        let purged = tier.purge_expired(now, 10).await.unwrap();
        assert_eq!(purged, vec![EntryKey::from("old")]);
        assert!(tier.exists(&EntryKey::from("live")).await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_only_ephemeral() {
        let (_dir, tier) = open().await;
        let embedder = MockEmbedder::default();
        tier.set(&vector_entry(EntryKey::from("kept"), embedder.axis(0), 1))
            .await
            .unwrap();
        tier.set(
            &vector_entry(EntryKey::from("scratch"), embedder.axis(1), 1)
                .with_durability(Durability::Ephemeral),
        )
        .await
        .unwrap();

        let evicted = tier
            .evict(EvictionHint {
                max_keys: 10,
                policy: EvictionPolicy::Lru,
            })
            .await
            .unwrap();
        assert_eq!(evicted, vec![EntryKey::from("scratch")]);
        assert!(tier.exists(&EntryKey::from("kept")).await.unwrap());
    }
}
