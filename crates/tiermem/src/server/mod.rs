//! Shared cache daemon
//!
//! Serves one in-process tier over the HTTP contract that
//! [`SharedTier`](crate::tier::SharedTier) speaks, so several manager
//! processes can share an L2 cache.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::error::{MemoryError, Result};
use crate::tier::LocalTier;

/// State shared by every handler
pub struct CacheState {
    pub tier: LocalTier,
}

impl CacheState {
    pub fn new(tier: LocalTier) -> Self {
        Self { tier }
    }
}

/// Build the router with all routes configured
pub fn create_router(state: Arc<CacheState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route(
            "/v1/entries/{namespace}/{key}",
            get(handlers::get_entry)
                .put(handlers::put_entry)
                .delete(handlers::delete_entry)
                .head(handlers::head_entry),
        )
        .route("/v1/stats", get(handlers::stats_handler))
        .route("/v1/evict", post(handlers::evict_handler))
        .route("/v1/purge", post(handlers::purge_handler))
        .with_state(state)
}

pub struct CacheServer {
    config: ServerConfig,
    state: Arc<CacheState>,
}

impl CacheServer {
    pub fn new(config: ServerConfig) -> Self {
        let tier = LocalTier::new(config.descriptor());
        Self {
            config,
            state: Arc::new(CacheState::new(tier)),
        }
    }

    pub fn state(&self) -> &Arc<CacheState> {
        &self.state
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn serve(&self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .map_err(|e| MemoryError::Config(format!("Invalid listen address: {e}")))?;

        let app = create_router(self.state.clone())
            .layer(TimeoutLayer::new(Duration::from_secs(
                self.config.request_timeout_secs.max(1),
            )))
            .layer(TraceLayer::new_for_http());

        tracing::info!(
            max_entries = self.config.max_entries,
            max_bytes = self.config.max_bytes,
            eviction = ?self.config.eviction,
            "Starting shared cache on {addr}"
        );

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MemoryError::Config(format!("Failed to bind to {addr}: {e}")))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| MemoryError::Storage(format!("Server error: {e}")))?;

        tracing::info!("Shared cache shut down gracefully");
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
