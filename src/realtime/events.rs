use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::QueueStatus;

/// Messages a client may send over the realtime channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session:join", rename_all = "camelCase")]
    SessionJoin {
        session_id: Uuid,
        #[serde(default)]
        viewer: bool,
    },
    /// Alias kept for clients resuming after a page reload.
    #[serde(rename = "session:reconnect", rename_all = "camelCase")]
    SessionReconnect {
        session_id: Uuid,
        #[serde(default)]
        viewer: bool,
    },
    #[serde(rename = "queue:join", rename_all = "camelCase")]
    QueueJoin { queue_id: Uuid },
}

/// Messages the server pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session:joined", rename_all = "camelCase")]
    SessionJoined {
        port: u16,
        time_remaining: i64,
        is_primary: bool,
        is_viewer: bool,
        viewer_count: usize,
    },
    #[serde(rename = "session:timer", rename_all = "camelCase")]
    SessionTimer { time_remaining: i64 },
    #[serde(rename = "session:warning", rename_all = "camelCase")]
    SessionWarning { seconds_left: i64 },
    #[serde(rename = "session:ended", rename_all = "camelCase")]
    SessionEnded { reason: String },
    #[serde(rename = "session:error", rename_all = "camelCase")]
    SessionError { error: String },
    #[serde(rename = "session:takeover")]
    SessionTakeover,
    #[serde(rename = "session:viewer-count", rename_all = "camelCase")]
    SessionViewerCount { count: usize },
    #[serde(rename = "queue:joined", rename_all = "camelCase")]
    QueueJoined {
        queue_id: Uuid,
        status: QueueStatus,
        position: usize,
        total_in_queue: usize,
        estimated_wait_seconds: u64,
    },
    #[serde(rename = "queue:status", rename_all = "camelCase")]
    QueueStatus {
        status: QueueStatus,
        position: usize,
        total_in_queue: usize,
        estimated_wait_seconds: u64,
    },
    #[serde(rename = "queue:ready", rename_all = "camelCase")]
    QueueReady { session_id: Uuid, port: u16 },
    #[serde(rename = "queue:error", rename_all = "camelCase")]
    QueueError { error: String },
    #[serde(rename = "queue:invalid")]
    QueueInvalid,
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_join_parses_camel_case() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"session:join","sessionId":"7f0c0f7e-58f7-4b9c-9e5d-1a2b3c4d5e6f","viewer":true}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SessionJoin { viewer, .. } => assert!(viewer),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn viewer_flag_defaults_to_false() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"session:join","sessionId":"7f0c0f7e-58f7-4b9c-9e5d-1a2b3c4d5e6f"}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::SessionJoin { viewer, .. } => assert!(!viewer),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn outbound_events_use_product_names() {
        let json = ServerMessage::SessionWarning { seconds_left: 30 }.to_json();
        assert!(json.contains(r#""type":"session:warning""#));
        assert!(json.contains(r#""secondsLeft":30"#));

        let json = ServerMessage::SessionTimer { time_remaining: 123 }.to_json();
        assert!(json.contains(r#""timeRemaining":123"#));

        let json = ServerMessage::SessionTakeover.to_json();
        assert_eq!(json, r#"{"type":"session:takeover"}"#);

        let json = ServerMessage::QueueStatus {
            status: QueueStatus::Preparing,
            position: 0,
            total_in_queue: 2,
            estimated_wait_seconds: 600,
        }
        .to_json();
        assert!(json.contains(r#""status":"preparing""#));
        assert!(json.contains(r#""estimatedWaitSeconds":600"#));
    }
}
