//! Shared tier client tests: wiremock for failure modes, a live daemon for round trips

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tiermem::error::MemoryError;
use tiermem::memory::{EntryKey, MemoryEntry, TierId};
use tiermem::server::{CacheState, create_router};
use tiermem::tier::shared::{ErrorBody, RetryPolicy};
use tiermem::tier::{
    Capacity, EvictionHint, EvictionPolicy, LocalTier, SharedTier, TierDescriptor, TierStore,
};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
    }
}

fn client(base: &str) -> SharedTier {
    let descriptor = TierDescriptor::new(TierId::L2).with_timeout(Duration::from_secs(2));
    SharedTier::new(base, descriptor, fast_retry()).unwrap()
}

fn entry(key: &str, sequence: u64) -> MemoryEntry {
    MemoryEntry::new(EntryKey::from(key), "value", sequence, Utc::now())
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/entries/default/a"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let tier = client(&server.uri());
        let err = tier.get(&EntryKey::from("a")).await.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::TierUnavailable {
                tier: TierId::L2,
                ..
            }
        ));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_recovers_after_transient_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/entries/default/a"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/entries/default/a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entry("a", 4)))
            .mount(&server)
            .await;

        let tier = client(&server.uri());
        let found = tier.get(&EntryKey::from("a")).await.unwrap().unwrap();
        assert_eq!(found.sequence, 4);
    }

    #[tokio::test]
    async fn test_hung_attempt_is_retried_within_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/entries/default/a"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(entry("a", 1))
                    .set_delay(Duration::from_secs(5)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/entries/default/a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entry("a", 2)))
            .mount(&server)
            .await;

        let descriptor = TierDescriptor::new(TierId::L2).with_timeout(Duration::from_millis(600));
        let tier = SharedTier::new(&server.uri(), descriptor, fast_retry()).unwrap();
        let started = std::time::Instant::now();
        let found = tier.get(&EntryKey::from("a")).await.unwrap().unwrap();
        assert_eq!(found.sequence, 2);
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_not_found_is_a_miss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/entries/default/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let tier = client(&server.uri());
        assert!(tier.get(&EntryKey::from("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conflict_maps_to_stale_write() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/entries/default/a"))
            .respond_with(ResponseTemplate::new(409).set_body_json(ErrorBody {
                error: "stale".to_string(),
                stored: Some(9),
                attempted: Some(3),
            }))
            .mount(&server)
            .await;

        let tier = client(&server.uri());
        match tier.set(&entry("a", 3)).await.unwrap_err() {
            MemoryError::StaleWriteRejected {
                key,
                stored,
                attempted,
            } => {
                assert_eq!(key, "default/a");
                assert_eq!(stored, 9);
                assert_eq!(attempted, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_insufficient_storage_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/entries/default/a"))
            .respond_with(ResponseTemplate::new(507))
            .expect(1)
            .mount(&server)
            .await;

        let tier = client(&server.uri());
        assert!(matches!(
            tier.set(&entry("a", 1)).await,
            Err(MemoryError::CapacityExceeded { tier: TierId::L2 })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let tier = client(&format!("http://{addr}"));
        assert!(tier.get(&EntryKey::from("a")).await.unwrap_err().is_transient());
        assert!(tier.ping().await.is_err());
    }
}

mod live_daemon {
    use super::*;

    async fn spawn_daemon(capacity: Capacity) -> (String, Arc<CacheState>) {
        let descriptor = TierDescriptor::new(TierId::L2).with_capacity(capacity);
        let state = Arc::new(CacheState::new(LocalTier::new(descriptor)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn test_round_trip_through_daemon() {
        let (base, state) = spawn_daemon(Capacity::unbounded()).await;
        let tier = client(&base);
        tier.ping().await.unwrap();

        let key = EntryKey::new("user/1", "notes about x");
        let stored = MemoryEntry::new(key.clone(), "hello", 1, Utc::now());
        tier.set(&stored).await.unwrap();

        let loaded = tier.get(&key).await.unwrap().unwrap();
        assert_eq!(loaded.value, stored.value);
        assert!(tier.exists(&key).await.unwrap());
        assert_eq!(state.tier.len(), 1);

        assert!(tier.delete(&key).await.unwrap());
        assert!(!tier.delete(&key).await.unwrap());
        assert!(tier.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_daemon_rejects_stale_write() {
        let (base, _state) = spawn_daemon(Capacity::unbounded()).await;
        let tier = client(&base);
        tier.set(&entry("a", 5)).await.unwrap();

        assert!(matches!(
            tier.set(&entry("a", 2)).await,
            Err(MemoryError::StaleWriteRejected {
                stored: 5,
                attempted: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_stats_evict_and_purge() {
        let (base, _state) = spawn_daemon(Capacity::unbounded()).await;
        let tier = client(&base);
        let now = Utc::now();
        tier.set(&entry("a", 1)).await.unwrap();
        tier.set(&entry("b", 1).with_ttl(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();

        assert_eq!(tier.approximate_size().await.unwrap().entries, 2);

        let purged = tier.purge_expired(now, 10).await.unwrap();
        assert_eq!(purged, vec![EntryKey::from("b")]);

        let evicted = tier
            .evict(EvictionHint {
                max_keys: 1,
                policy: EvictionPolicy::Lru,
            })
            .await
            .unwrap();
        assert_eq!(evicted, vec![EntryKey::from("a")]);
        assert_eq!(tier.approximate_size().await.unwrap().entries, 0);
    }
}
