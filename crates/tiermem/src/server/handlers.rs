use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::CacheState;
use crate::error::MemoryError;
use crate::memory::types::{EntryKey, MemoryEntry};
use crate::tier::shared::{DeleteResponse, ErrorBody, PurgeRequest};
use crate::tier::{EvictionHint, TierStats, TierStore};

/// Maps tier errors onto the status codes `SharedTier` understands
pub struct ApiError(MemoryError);

impl From<MemoryError> for ApiError {
    fn from(e: MemoryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, stored, attempted) = match &self.0 {
            MemoryError::NotFound(_) => (StatusCode::NOT_FOUND, None, None),
            MemoryError::StaleWriteRejected {
                stored, attempted, ..
            } => (StatusCode::CONFLICT, Some(*stored), Some(*attempted)),
            MemoryError::CapacityExceeded { .. } => (StatusCode::INSUFFICIENT_STORAGE, None, None),
            MemoryError::InvalidInput(_) | MemoryError::Serialization(_) => {
                (StatusCode::BAD_REQUEST, None, None)
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None, None),
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            stored,
            attempted,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn get_entry(
    State(state): State<Arc<CacheState>>,
    Path((namespace, key)): Path<(String, String)>,
) -> ApiResult<Json<MemoryEntry>> {
    let key = EntryKey::new(namespace, key);
    match state.tier.get(&key).await? {
        Some(entry) => Ok(Json(entry)),
        None => Err(MemoryError::NotFound(key.to_string()).into()),
    }
}

pub async fn put_entry(
    State(state): State<Arc<CacheState>>,
    Path((namespace, key)): Path<(String, String)>,
    Json(entry): Json<MemoryEntry>,
) -> ApiResult<StatusCode> {
    if entry.key.namespace != namespace || entry.key.key != key {
        return Err(MemoryError::InvalidInput(format!(
            "Body key {} does not match path {namespace}/{key}",
            entry.key
        ))
        .into());
    }
    state.tier.set(&entry).await?;
    debug!(key = %entry.key, sequence = entry.sequence, "stored");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_entry(
    State(state): State<Arc<CacheState>>,
    Path((namespace, key)): Path<(String, String)>,
) -> ApiResult<Json<DeleteResponse>> {
    let deleted = state.tier.delete(&EntryKey::new(namespace, key)).await?;
    Ok(Json(DeleteResponse { deleted }))
}

pub async fn head_entry(
    State(state): State<Arc<CacheState>>,
    Path((namespace, key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if state.tier.exists(&EntryKey::new(namespace, key)).await? {
        Ok(StatusCode::OK)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

pub async fn stats_handler(State(state): State<Arc<CacheState>>) -> ApiResult<Json<TierStats>> {
    Ok(Json(state.tier.approximate_size().await?))
}

pub async fn evict_handler(
    State(state): State<Arc<CacheState>>,
    Json(hint): Json<EvictionHint>,
) -> ApiResult<Json<Vec<EntryKey>>> {
    Ok(Json(state.tier.evict(hint).await?))
}

pub async fn purge_handler(
    State(state): State<Arc<CacheState>>,
    Json(request): Json<PurgeRequest>,
) -> ApiResult<Json<Vec<EntryKey>>> {
    Ok(Json(
        state.tier.purge_expired(request.now, request.limit).await?,
    ))
}
