use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{ClientMessage, ServerMessage};
use crate::queue::{QueueCallback, QueueStatus, QueueUpdate};
use crate::server::AppState;

pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// One WebSocket connection through its full lifecycle: register, message
/// loop, cleanup.
async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let client_id = Uuid::new_v4();
    info!(client_id = %client_id, "ws: client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    // Write loop: forwards queued frames to the socket in order.
    let write_client_id = client_id;
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                debug!(client_id = %write_client_id, "ws: write loop closed");
                break;
            }
        }
    });

    state
        .realtime
        .register_client(client_id, client_tx.clone())
        .await;

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(client_id = %client_id, error = %e, "ws: read error");
                break;
            }
        };

        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        match parsed {
            Ok(ClientMessage::SessionJoin { session_id, viewer })
            | Ok(ClientMessage::SessionReconnect { session_id, viewer }) => {
                state.realtime.join_session(client_id, session_id, viewer).await;
            }
            Ok(ClientMessage::QueueJoin { queue_id }) => {
                handle_queue_join(&state, queue_id, &client_tx).await;
            }
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "ws: invalid message");
                let _ = client_tx.send(
                    ServerMessage::SessionError {
                        error: "Invalid message".to_string(),
                    }
                    .to_json(),
                );
            }
        }
    }

    state.realtime.unregister_client(client_id).await;
    write_handle.abort();
    info!(client_id = %client_id, "ws: client disconnected");
}

/// Attach this connection to a queue entry: ack with the current snapshot,
/// then relay worker callbacks as queue events.
async fn handle_queue_join(
    state: &Arc<AppState>,
    queue_id: Uuid,
    client_tx: &mpsc::UnboundedSender<String>,
) {
    let Some(entry) = state.queue.get(queue_id).await else {
        let _ = client_tx.send(ServerMessage::QueueInvalid.to_json());
        return;
    };

    let relay = client_tx.clone();
    let callback: QueueCallback = Arc::new(move |update: QueueUpdate| {
        let message = match update.entry.status {
            QueueStatus::Ready => match (update.entry.session_id, update.entry.port) {
                (Some(session_id), Some(port)) => ServerMessage::QueueReady { session_id, port },
                _ => ServerMessage::QueueError {
                    error: "Session could not be prepared".to_string(),
                },
            },
            QueueStatus::RateLimited => ServerMessage::QueueError {
                error: "Daily session limit reached".to_string(),
            },
            status => ServerMessage::QueueStatus {
                status,
                position: update.entry.position,
                total_in_queue: update.total_in_queue,
                estimated_wait_seconds: update.estimated_wait_secs,
            },
        };
        // Closed clients are dropped silently; the worker must not care.
        let _ = relay.send(message.to_json());
    });

    if !state.queue.subscribe(queue_id, callback).await {
        let _ = client_tx.send(ServerMessage::QueueInvalid.to_json());
        return;
    }

    let _ = client_tx.send(
        ServerMessage::QueueJoined {
            queue_id: entry.id,
            status: entry.status,
            position: entry.position,
            total_in_queue: state.queue.len().await,
            estimated_wait_seconds: state.queue.estimated_wait_secs().await,
        }
        .to_json(),
    );
}
