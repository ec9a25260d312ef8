mod manager;
pub mod url;

pub use manager::{
    CreateOutcome, RateLimitOverview, RateLimitStatus, SessionManager, SessionStats,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
    Expired,
}

/// A live or recently finished browsing session. Values handed out by the
/// manager are snapshots; mutation happens only inside the manager.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub container_id: Uuid,
    pub port: u16,
    pub url: String,
    pub anon_ip: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub end_reason: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Seconds until expiry, clamped at zero. Zero for finished sessions.
    pub fn time_remaining_secs(&self) -> i64 {
        if !self.is_active() {
            return 0;
        }
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}
