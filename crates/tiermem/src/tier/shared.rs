//! Shared cache tier (L2)
//!
//! HTTP client for a `tiermem-cache` daemon. Connection failures, timeouts
//! and 5xx responses are retried with exponential backoff; once retries run
//! out the call fails with `TierUnavailable` instead of blocking.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::{EvictionHint, TierDescriptor, TierStats, TierStore};
use crate::error::{MemoryError, Result};
use crate::memory::types::{EntryKey, MemoryEntry, TierId};

/// Body of `DELETE /v1/entries/{namespace}/{key}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

/// Body of `POST /v1/purge`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PurgeRequest {
    pub now: DateTime<Utc>,
    pub limit: usize,
}

/// Error body returned by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempted: Option<u64>,
}

/// Retry settings for L2 requests
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sum of the pauses between attempts
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retries)
            .map(|i| self.base_delay.saturating_mul(1u32 << i.min(16)))
            .sum()
    }

    /// Time one attempt may take so that all attempts and their backoff
    /// fit in `budget`. When the backoff alone exceeds the budget the
    /// attempts split it evenly and the pauses shrink instead.
    pub fn attempt_timeout(&self, budget: Duration) -> Duration {
        let usable = budget.saturating_sub(self.total_backoff());
        let share = if usable.is_zero() { budget } else { usable };
        (share / self.attempts()).max(Duration::from_millis(1))
    }
}

pub struct SharedTier {
    client: Client,
    base: Url,
    descriptor: TierDescriptor,
    retry: RetryPolicy,
}

impl SharedTier {
    pub fn new(base_url: &str, descriptor: TierDescriptor, retry: RetryPolicy) -> Result<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| MemoryError::Config(format!("Invalid L2 url {base_url}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(descriptor.timeout)
            .build()
            .map_err(|e| MemoryError::Config(format!("Failed to build L2 client: {e}")))?;

        Ok(Self {
            client,
            base,
            descriptor,
            retry,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| MemoryError::Storage(format!("Invalid L2 path {path}: {e}")))
    }

    fn entry_url(&self, key: &EntryKey) -> Result<Url> {
        self.url(&format!(
            "v1/entries/{}/{}",
            urlencoding::encode(&key.namespace),
            urlencoding::encode(&key.key)
        ))
    }

    /// Send with retry; `build` is called once per attempt. Every attempt
    /// and pause happens inside the tier timeout.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let budget = self.descriptor.timeout;
        let deadline = tokio::time::Instant::now() + budget;
        let per_attempt = self.retry.attempt_timeout(budget);
        let mut delay = self.retry.base_delay;
        let mut last_error = String::from("no attempt fit in the timeout");
        let mut attempts = 0;

        for attempt in 0..self.retry.attempts() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            attempts += 1;
            match build().timeout(per_attempt.min(remaining)).send().await {
                Ok(response)
                    if response.status().is_server_error()
                        && response.status() != StatusCode::INSUFFICIENT_STORAGE =>
                {
                    last_error = format!("server returned {}", response.status());
                }
                Ok(response) => return Ok(response),
                Err(e) => last_error = e.to_string(),
            }

            if attempt < self.retry.max_retries {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let pause = delay.min(remaining.saturating_sub(per_attempt));
                warn!(
                    "L2 request failed on attempt {}/{}, retrying in {:?}: {}",
                    attempt + 1,
                    self.retry.attempts(),
                    pause,
                    last_error
                );
                tokio::time::sleep(pause).await;
                delay = delay.saturating_mul(2);
            }
        }

        Err(MemoryError::unavailable(
            TierId::L2,
            format!("failed after {attempts} attempts: {last_error}"),
        ))
    }

    async fn error_for(&self, response: Response, key: Option<&EntryKey>) -> MemoryError {
        let status = response.status();
        let body: Option<ErrorBody> = response.json().await.ok();
        match status {
            StatusCode::CONFLICT => MemoryError::StaleWriteRejected {
                key: key.map(ToString::to_string).unwrap_or_default(),
                stored: body.as_ref().and_then(|b| b.stored).unwrap_or_default(),
                attempted: body.as_ref().and_then(|b| b.attempted).unwrap_or_default(),
            },
            StatusCode::INSUFFICIENT_STORAGE => MemoryError::CapacityExceeded { tier: TierId::L2 },
            _ => MemoryError::Storage(format!(
                "L2 returned {status}: {}",
                body.map(|b| b.error).unwrap_or_else(|| "Unknown error".to_string())
            )),
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| MemoryError::Serialization(format!("Invalid L2 response: {e}")))
    }

    /// `GET /health` without retries
    pub async fn ping(&self) -> Result<()> {
        let url = self.url("health")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| MemoryError::unavailable(TierId::L2, e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(MemoryError::unavailable(
                TierId::L2,
                format!("health returned {}", response.status()),
            ))
        }
    }
}

#[async_trait]
impl TierStore for SharedTier {
    fn descriptor(&self) -> &TierDescriptor {
        &self.descriptor
    }

    async fn get(&self, key: &EntryKey) -> Result<Option<MemoryEntry>> {
        let url = self.entry_url(key)?;
        let response = self.send(|| self.client.get(url.clone())).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                debug!(key = %key, "L2 hit");
                Ok(Some(Self::decode(response).await?))
            }
            _ => Err(self.error_for(response, Some(key)).await),
        }
    }

    async fn set(&self, entry: &MemoryEntry) -> Result<()> {
        let url = self.entry_url(&entry.key)?;
        let response = self
            .send(|| self.client.put(url.clone()).json(entry))
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_for(response, Some(&entry.key)).await)
        }
    }

    async fn delete(&self, key: &EntryKey) -> Result<bool> {
        let url = self.entry_url(key)?;
        let response = self.send(|| self.client.delete(url.clone())).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(Self::decode::<DeleteResponse>(response).await?.deleted),
            _ => Err(self.error_for(response, Some(key)).await),
        }
    }

    async fn exists(&self, key: &EntryKey) -> Result<bool> {
        let url = self.entry_url(key)?;
        let response = self.send(|| self.client.head(url.clone())).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            _ => Err(self.error_for(response, Some(key)).await),
        }
    }

    async fn approximate_size(&self) -> Result<TierStats> {
        let url = self.url("v1/stats")?;
        let response = self.send(|| self.client.get(url.clone())).await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, None).await);
        }
        Self::decode(response).await
    }

    async fn evict(&self, hint: EvictionHint) -> Result<Vec<EntryKey>> {
        let url = self.url("v1/evict")?;
        let response = self
            .send(|| self.client.post(url.clone()).json(&hint))
            .await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, None).await);
        }
        Self::decode(response).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<EntryKey>> {
        let url = self.url("v1/purge")?;
        let request = PurgeRequest { now, limit };
        let response = self
            .send(|| self.client.post(url.clone()).json(&request))
            .await?;
        if !response.status().is_success() {
            return Err(self.error_for(response, None).await);
        }
        Self::decode(response).await
    }
}
