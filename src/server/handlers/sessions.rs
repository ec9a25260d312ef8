use axum::{
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::server::error::{ApiError, ApiResult};
use crate::server::middleware::client_ip;
use crate::server::AppState;
use crate::session::url::normalize_url;
use crate::session::Session;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub queue_id: Uuid,
    pub position: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub id: Uuid,
    pub status: crate::session::SessionStatus,
    pub port: u16,
    pub url: String,
    pub started_at: String,
    pub expires_at: String,
    pub time_remaining: i64,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            status: session.status,
            port: session.port,
            url: session.url.clone(),
            started_at: session.started_at.to_rfc3339(),
            expires_at: session.expires_at.to_rfc3339(),
            time_remaining: session.time_remaining_secs(),
        }
    }
}

/// Every accepted submission lands in the queue, even with warm capacity
/// available; the rate limit is enforced at promotion so the client always
/// sees the queue page first.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    if state.sessions.is_paused().await {
        return Err(ApiError::Paused);
    }

    let url = request
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::BadRequest("URL is required".to_string()))?;

    // Screen the URL before anything is created or counted.
    normalize_url(url).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let ip = client_ip(&headers, &addr);
    let entry = state.queue.enqueue(url, &ip).await;

    Ok(Json(CreateSessionResponse {
        queue_id: entry.id,
        position: entry.position,
    }))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SessionResponse>> {
    let session = state
        .sessions
        .get_session(id)
        .await
        .ok_or_else(|| ApiError::NotFound("Session not found".to_string()))?;

    Ok(Json(session.into()))
}

#[derive(Debug, Serialize)]
pub struct RateLimitResponse {
    pub used: u32,
    pub remaining: u32,
    pub limit: u32,
}

pub async fn rate_limit_status(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Json<RateLimitResponse> {
    let ip = client_ip(&headers, &addr);
    let status = state.sessions.check_rate_limit(&ip).await;

    Json(RateLimitResponse {
        used: status.used,
        remaining: status.remaining,
        limit: state.sessions.rate_limit_per_day(),
    })
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub ended: bool,
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EndSessionResponse>> {
    if state.sessions.get_session(id).await.is_none() {
        return Err(ApiError::NotFound("Session not found".to_string()));
    }

    let ended = state.sessions.end_session(id, "user_ended").await;
    if ended {
        state.realtime.notify_session_ended(id, "user_ended").await;
    }

    Ok(Json(EndSessionResponse { ended }))
}
