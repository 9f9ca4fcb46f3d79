//! HTTP contract tests for the cache daemon router

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use tower::ServiceExt;

use tiermem::memory::{EntryKey, MemoryEntry, TierId};
use tiermem::server::{CacheState, create_router};
use tiermem::tier::shared::{DeleteResponse, ErrorBody, PurgeRequest};
use tiermem::tier::{Capacity, LocalTier, TierDescriptor, TierStats};

fn app_with(capacity: Capacity) -> (Router, Arc<CacheState>) {
    let descriptor = TierDescriptor::new(TierId::L2).with_capacity(capacity);
    let state = Arc::new(CacheState::new(LocalTier::new(descriptor)));
    (create_router(state.clone()), state)
}

fn app() -> (Router, Arc<CacheState>) {
    app_with(Capacity::unbounded())
}

fn put_request(uri: &str, entry: &MemoryEntry) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(entry).unwrap()))
        .unwrap()
}

fn empty_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let (app, _) = app();
    let response = app
        .oneshot(empty_request(Method::GET, "/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = json_body(response).await;
    assert_eq!(body["status"], "ok");
}

mod entries {
    use super::*;

    #[tokio::test]
    async fn test_put_then_get() {
        let (app, state) = app();
        let entry = MemoryEntry::new(EntryKey::new("notes", "a"), "hello", 1, Utc::now());

        let response = app
            .clone()
            .oneshot(put_request("/v1/entries/notes/a", &entry))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.tier.len(), 1);

        let response = app
            .oneshot(empty_request(Method::GET, "/v1/entries/notes/a"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let loaded: MemoryEntry = json_body(response).await;
        assert_eq!(loaded.value, entry.value);
        assert_eq!(loaded.sequence, 1);
    }

    #[tokio::test]
    async fn test_missing_entry_is_404() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/v1/entries/notes/none"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(empty_request(Method::HEAD, "/v1/entries/notes/none"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mismatched_body_key_is_400() {
        let (app, state) = app();
        let entry = MemoryEntry::new(EntryKey::new("notes", "other"), "hello", 1, Utc::now());
        let response = app
            .oneshot(put_request("/v1/entries/notes/a", &entry))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.tier.is_empty());
    }

    #[tokio::test]
    async fn test_stale_put_is_409_with_sequences() {
        let (app, _) = app();
        let key = EntryKey::new("notes", "a");
        let newer = MemoryEntry::new(key.clone(), "new", 7, Utc::now());
        let older = MemoryEntry::new(key, "old", 2, Utc::now());

        app.clone()
            .oneshot(put_request("/v1/entries/notes/a", &newer))
            .await
            .unwrap();
        let response = app
            .oneshot(put_request("/v1/entries/notes/a", &older))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: ErrorBody = json_body(response).await;
        assert_eq!(body.stored, Some(7));
        assert_eq!(body.attempted, Some(2));
    }

    #[tokio::test]
    async fn test_oversized_put_is_507() {
        let (app, _) = app_with(Capacity::unbounded().with_max_bytes(8));
        let entry = MemoryEntry::new(
            EntryKey::new("notes", "a"),
            "far more than eight bytes",
            1,
            Utc::now(),
        );
        let response = app
            .oneshot(put_request("/v1/entries/notes/a", &entry))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let (app, _) = app();
        let entry = MemoryEntry::new(EntryKey::new("notes", "a"), "hello", 1, Utc::now());
        app.clone()
            .oneshot(put_request("/v1/entries/notes/a", &entry))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(empty_request(Method::DELETE, "/v1/entries/notes/a"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: DeleteResponse = json_body(response).await;
        assert!(body.deleted);

        let response = app
            .oneshot(empty_request(Method::DELETE, "/v1/entries/notes/a"))
            .await
            .unwrap();
        let body: DeleteResponse = json_body(response).await;
        assert!(!body.deleted);
    }

    #[tokio::test]
    async fn test_encoded_segments_are_decoded() {
        let (app, state) = app();
        let key = EntryKey::new("user/1", "a b");
        let entry = MemoryEntry::new(key.clone(), "hello", 1, Utc::now());
        let response = app
            .oneshot(put_request("/v1/entries/user%2F1/a%20b", &entry))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(state.tier.keys(), vec![key]);
    }
}

mod maintenance {
    use super::*;

    #[tokio::test]
    async fn test_stats_and_purge() {
        let (app, _) = app();
        let now = Utc::now();
        let live = MemoryEntry::new(EntryKey::new("n", "live"), "x", 1, now);
        let dead = MemoryEntry::new(EntryKey::new("n", "dead"), "x", 1, now)
            .with_ttl(now - chrono::Duration::seconds(1));
        for (uri, entry) in [("/v1/entries/n/live", &live), ("/v1/entries/n/dead", &dead)] {
            app.clone().oneshot(put_request(uri, entry)).await.unwrap();
        }

        let response = app
            .clone()
            .oneshot(empty_request(Method::GET, "/v1/stats"))
            .await
            .unwrap();
        let stats: TierStats = json_body(response).await;
        assert_eq!(stats.entries, 2);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/purge")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&PurgeRequest { now, limit: 10 }).unwrap(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let purged: Vec<EntryKey> = json_body(response).await;
        assert_eq!(purged, vec![EntryKey::new("n", "dead")]);
    }

    #[tokio::test]
    async fn test_evict_uses_hint() {
        let (app, state) = app();
        for key in ["a", "b", "c"] {
            let entry = MemoryEntry::new(EntryKey::new("n", key), "x", 1, Utc::now());
            app.clone()
                .oneshot(put_request(&format!("/v1/entries/n/{key}"), &entry))
                .await
                .unwrap();
        }

        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/evict")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"max_keys":2,"policy":"lru"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let evicted: Vec<EntryKey> = json_body(response).await;
        assert_eq!(evicted.len(), 2);
        assert_eq!(state.tier.len(), 1);
    }
}
