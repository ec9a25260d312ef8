use axum::{extract::State, http::header, response::IntoResponse, Json};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::docker::ContainerStatus;
use crate::metrics::{self, MetricsSnapshot};
use crate::server::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    pub total: usize,
    pub warm: usize,
    pub active: usize,
    pub booting: usize,
    pub target: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub pool: PoolSummary,
    pub active_sessions: usize,
    pub queue_length: usize,
}

pub async fn pool_summary(state: &AppState) -> PoolSummary {
    let containers = state.pool.status().await;
    PoolSummary {
        total: containers.len(),
        warm: containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Warm)
            .count(),
        active: containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Active)
            .count(),
        booting: containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Booting)
            .count(),
        target: state.pool.target_size(),
    }
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = state.sessions.stats().await;
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        pool: pool_summary(&state).await,
        active_sessions: stats.active_sessions,
        queue_length: state.queue.len().await,
    })
}

pub async fn scrape_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sessions.stats().await;
    let pool = pool_summary(&state).await;

    let snapshot = MetricsSnapshot {
        sessions_today: stats.sessions_today,
        active_sessions: stats.active_sessions,
        queue_length: state.queue.len().await,
        pool_size: pool.total,
        pool_warm: pool.warm,
        pool_booting: pool.booting,
        peak_concurrent: stats.peak_concurrent,
        session_duration_secs: stats.current_duration_secs,
        paused: stats.paused,
    };

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(&snapshot),
    )
}
