//! HTTP Status Server
//!
//! Read-only view of the latest poll cycle and recovery sweep.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::Result;
use crate::replication::{CycleReport, StatusBoard, SweepReport};

/// Shared application state
pub struct AppState {
    pub status: Arc<StatusBoard>,
    pub started_at: DateTime<Utc>,
}

pub struct StatusServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl StatusServer {
    pub fn new(config: ApiConfig, status: Arc<StatusBoard>) -> Self {
        let state = Arc::new(AppState {
            status,
            started_at: Utc::now(),
        });
        Self { config, state }
    }

    fn create_router(state: Arc<AppState>, cors: bool) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        if cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Serve until `shutdown` turns true
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP status API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP status API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await?;

        tracing::info!("HTTP status API stopped");
        Ok(())
    }
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: String,
    pub uptime_secs: i64,
}

/// Status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub started_at: DateTime<Utc>,
    pub last_cycle: Option<CycleReport>,
    pub last_sweep: Option<SweepReport>,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.status.snapshot().await;
    Json(StatusResponse {
        started_at: state.started_at,
        last_cycle: snapshot.last_cycle,
        last_sweep: snapshot.last_sweep,
    })
}
