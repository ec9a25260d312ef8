use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::server::error::{ApiError, ApiResult};
use crate::server::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryResponse {
    pub id: Uuid,
    pub status: crate::queue::QueueStatus,
    pub position: usize,
    pub total_in_queue: usize,
    pub estimated_wait_seconds: u64,
    pub created_at: String,
}

pub async fn get_queue_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<QueueEntryResponse>> {
    let entry = state
        .queue
        .get(id)
        .await
        .ok_or_else(|| ApiError::NotFound("Queue entry not found".to_string()))?;

    Ok(Json(QueueEntryResponse {
        id: entry.id,
        status: entry.status,
        position: entry.position,
        total_in_queue: state.queue.len().await,
        estimated_wait_seconds: state.queue.estimated_wait_secs().await,
        created_at: entry.created_at.to_rfc3339(),
    }))
}

#[derive(Debug, Serialize)]
pub struct LeaveQueueResponse {
    pub left: bool,
}

pub async fn leave_queue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LeaveQueueResponse>> {
    if !state.queue.leave(id).await {
        return Err(ApiError::NotFound("Queue entry not found".to_string()));
    }
    Ok(Json(LeaveQueueResponse { left: true }))
}
