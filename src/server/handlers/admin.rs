use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use super::system::{pool_summary, PoolSummary};
use crate::docker::ContainerStatus;
use crate::logstore::HistoryRow;
use crate::queue::QueueEntry;
use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::session::RateLimitOverview;

const MIN_POOL_SIZE: usize = 1;
const MAX_POOL_SIZE: usize = 20;
const MIN_DURATION_SECS: u64 = 60;
const MAX_DURATION_SECS: u64 = 1800;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminSessionRow {
    pub id: Uuid,
    pub url: String,
    pub anon_ip: String,
    pub status: crate::session::SessionStatus,
    pub port: u16,
    pub started_at: String,
    pub expires_at: String,
    pub time_remaining: i64,
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<AdminSessionRow>> {
    let rows = state
        .sessions
        .active_sessions()
        .await
        .into_iter()
        .map(|s| AdminSessionRow {
            id: s.id,
            url: s.url.clone(),
            anon_ip: s.anon_ip.clone(),
            status: s.status,
            port: s.port,
            started_at: s.started_at.to_rfc3339(),
            expires_at: s.expires_at.to_rfc3339(),
            time_remaining: s.time_remaining_secs(),
        })
        .collect();
    Json(rows)
}

pub async fn list_queue(State(state): State<Arc<AppState>>) -> Json<Vec<QueueEntry>> {
    Json(state.queue.waiting_entries().await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolContainerView {
    pub id: Uuid,
    pub name: String,
    pub port: u16,
    pub status: String,
    pub session_id: Option<Uuid>,
    pub created_at: String,
}

/// Pool snapshot with the derived `reconnecting` status: an active container
/// whose session sits in the abandonment grace window. Pure aggregation.
pub async fn pool_status(State(state): State<Arc<AppState>>) -> Json<Vec<PoolContainerView>> {
    let reconnecting = state.realtime.reconnecting_sessions().await;

    let view = state
        .pool
        .status()
        .await
        .into_iter()
        .map(|c| {
            let status = match (c.status, c.session_id) {
                (ContainerStatus::Active, Some(session_id))
                    if reconnecting.contains(&session_id) =>
                {
                    "reconnecting".to_string()
                }
                (status, _) => serde_json::to_value(status)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "unknown".to_string()),
            };
            PoolContainerView {
                id: c.id,
                name: c.name,
                port: c.port,
                status,
                session_id: c.session_id,
                created_at: c.created_at.to_rfc3339(),
            }
        })
        .collect();

    Json(view)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    pub active_sessions: usize,
    pub queue_length: usize,
    pub pool: PoolSummary,
    pub sessions_today: u64,
    pub sessions_this_week: i64,
    pub peak_concurrent: usize,
    pub avg_session_duration_secs: u64,
    pub weekly_avg_duration_secs: Option<f64>,
    pub current_duration_secs: u64,
    pub pool_size: usize,
    pub paused: bool,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<AdminStats>> {
    let session_stats = state.sessions.stats().await;
    let week_ago = Utc::now() - ChronoDuration::days(7);

    Ok(Json(AdminStats {
        active_sessions: session_stats.active_sessions,
        queue_length: state.queue.len().await,
        pool: pool_summary(&state).await,
        sessions_today: session_stats.sessions_today,
        sessions_this_week: state.log_store.sessions_since(week_ago).await?,
        peak_concurrent: session_stats.peak_concurrent,
        avg_session_duration_secs: session_stats.avg_session_duration_secs,
        weekly_avg_duration_secs: state.log_store.avg_duration_since(week_ago).await?,
        current_duration_secs: session_stats.current_duration_secs,
        pool_size: state.pool.target_size(),
        paused: session_stats.paused,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    pub search: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    50
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub rows: Vec<HistoryRow>,
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
}

pub async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let (rows, total) = state
        .log_store
        .history(query.page, query.per_page, query.search.as_deref())
        .await?;

    Ok(Json(HistoryResponse {
        rows,
        total,
        page: query.page.max(1),
        per_page: query.per_page,
    }))
}

pub async fn rate_limits(State(state): State<Arc<AppState>>) -> Json<RateLimitOverview> {
    Json(state.sessions.rate_limit_overview().await)
}

#[derive(Debug, Deserialize)]
pub struct IpRequest {
    pub ip: String,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

fn ok() -> Json<OkResponse> {
    Json(OkResponse { ok: true })
}

pub async fn block_ip(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IpRequest>,
) -> Json<OkResponse> {
    state.sessions.block_ip(&request.ip).await;
    ok()
}

pub async fn unblock_ip(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IpRequest>,
) -> Json<OkResponse> {
    state.sessions.unblock_ip(&request.ip).await;
    ok()
}

pub async fn whitelist_ip(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IpRequest>,
) -> Json<OkResponse> {
    state.sessions.whitelist_ip(&request.ip).await;
    ok()
}

pub async fn unwhitelist_ip(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IpRequest>,
) -> Json<OkResponse> {
    state.sessions.unwhitelist_ip(&request.ip).await;
    ok()
}

pub async fn clear_limit(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IpRequest>,
) -> Json<OkResponse> {
    state.sessions.clear_limit(&request.ip).await;
    ok()
}

pub async fn kill_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<OkResponse>> {
    if state.sessions.get_session(id).await.is_none() {
        return Err(ApiError::NotFound("Session not found".to_string()));
    }

    if state.sessions.end_session(id, "admin_killed").await {
        state.realtime.notify_session_ended(id, "admin_killed").await;
    }
    Ok(ok())
}

pub async fn pause(State(state): State<Arc<AppState>>) -> Json<OkResponse> {
    state.sessions.set_paused(true).await;
    ok()
}

pub async fn resume(State(state): State<Arc<AppState>>) -> Json<OkResponse> {
    state.sessions.set_paused(false).await;
    ok()
}

#[derive(Debug, Serialize)]
pub struct DrainResponse {
    pub drained: usize,
}

pub async fn drain_queue(State(state): State<Arc<AppState>>) -> Json<DrainResponse> {
    Json(DrainResponse {
        drained: state.queue.drain().await,
    })
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    pub destroyed: usize,
}

pub async fn restart_pool(State(state): State<Arc<AppState>>) -> Json<RestartResponse> {
    Json(RestartResponse {
        destroyed: state.pool.restart().await,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub pool_size: Option<usize>,
    pub session_duration: Option<u64>,
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> ApiResult<Json<OkResponse>> {
    if let Some(pool_size) = update.pool_size {
        if !(MIN_POOL_SIZE..=MAX_POOL_SIZE).contains(&pool_size) {
            return Err(ApiError::BadRequest(format!(
                "Pool size must be between {} and {}",
                MIN_POOL_SIZE, MAX_POOL_SIZE
            )));
        }
        state.pool.set_pool_size(pool_size);
    }

    if let Some(duration) = update.session_duration {
        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&duration) {
            return Err(ApiError::BadRequest(format!(
                "Session duration must be between {}s and {}s",
                MIN_DURATION_SECS, MAX_DURATION_SECS
            )));
        }
        state.sessions.set_duration(duration).await;
    }

    Ok(ok())
}
