use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{info, warn};
use uuid::Uuid;

use super::url::{anonymize_ip, normalize_url, UrlError};
use super::{Session, SessionStatus};
use crate::docker::ContainerPool;
use crate::logstore::SessionLogStore;

const EXPIRY_TICK: Duration = Duration::from_secs(5);
/// Finished sessions linger this long so the realtime channel can observe
/// the terminal state before the record is pruned.
const TERMINAL_RETENTION_SECS: i64 = 120;
/// Rolling window of recent actual session durations.
const DURATION_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub used: u32,
    pub remaining: u32,
    pub blocked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub sessions_today: u64,
    pub peak_concurrent: usize,
    pub avg_session_duration_secs: u64,
    pub current_duration_secs: u64,
    pub paused: bool,
}

pub enum CreateOutcome {
    Started(Session),
    /// No warm container was available; the caller requeues.
    Queued,
}

struct SessionInner {
    sessions: HashMap<Uuid, Session>,
    blocked: HashSet<String>,
    whitelist: HashSet<String>,
    ip_count_today: HashMap<String, u32>,
    counter_date: NaiveDate,
    paused: bool,
    current_duration_secs: u64,
    recent_durations: VecDeque<u64>,
    sessions_today: u64,
    peak_concurrent: usize,
}

impl SessionInner {
    fn new(duration_secs: u64) -> Self {
        Self {
            sessions: HashMap::new(),
            blocked: HashSet::new(),
            whitelist: HashSet::new(),
            ip_count_today: HashMap::new(),
            counter_date: chrono::Local::now().date_naive(),
            paused: false,
            current_duration_secs: duration_secs,
            recent_durations: VecDeque::new(),
            sessions_today: 0,
            peak_concurrent: 0,
        }
    }

    fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    /// Daily counters reset on the first call after the local date changes.
    fn roll_date(&mut self, today: NaiveDate) {
        if today != self.counter_date {
            info!("Daily counter reset ({} -> {})", self.counter_date, today);
            self.counter_date = today;
            self.ip_count_today.clear();
            self.sessions_today = 0;
            self.peak_concurrent = self.active_count();
        }
    }

    fn rate_limit_status(&self, ip: &str, limit: u32) -> RateLimitStatus {
        if self.blocked.contains(ip) {
            return RateLimitStatus {
                allowed: false,
                used: 0,
                remaining: 0,
                blocked: true,
            };
        }
        let used = self.ip_count_today.get(ip).copied().unwrap_or(0);
        if self.whitelist.contains(ip) {
            return RateLimitStatus {
                allowed: true,
                used,
                remaining: limit,
                blocked: false,
            };
        }
        let remaining = limit.saturating_sub(used);
        RateLimitStatus {
            allowed: remaining > 0,
            used,
            remaining,
            blocked: false,
        }
    }

    fn push_duration(&mut self, secs: u64) {
        if self.recent_durations.len() == DURATION_WINDOW {
            self.recent_durations.pop_front();
        }
        self.recent_durations.push_back(secs);
    }

    /// Mean over the rolling window; the configured duration stands in until
    /// the first session completes.
    fn avg_duration_secs(&self) -> u64 {
        if self.recent_durations.is_empty() {
            return self.current_duration_secs;
        }
        let sum: u64 = self.recent_durations.iter().sum();
        sum / self.recent_durations.len() as u64
    }

    /// Move an active session to its terminal state and record the actual
    /// duration. Returns None when the session is unknown or already done.
    fn finish_session(
        &mut self,
        id: Uuid,
        reason: &str,
        now: chrono::DateTime<Utc>,
    ) -> Option<Session> {
        let session = self.sessions.get_mut(&id)?;
        if session.status != SessionStatus::Active {
            return None;
        }

        session.status = if reason == "expired" {
            SessionStatus::Expired
        } else {
            SessionStatus::Ended
        };
        session.end_reason = Some(reason.to_string());
        session.ended_at = Some(now);

        let snapshot = session.clone();
        let actual = (now - snapshot.started_at).num_seconds().max(0) as u64;
        self.push_duration(actual);
        Some(snapshot)
    }
}

/// Owns session identity, lifecycle and the per-IP policy state.
pub struct SessionManager {
    pool: Arc<ContainerPool>,
    log_store: Arc<SessionLogStore>,
    rate_limit_per_day: u32,
    inner: Mutex<SessionInner>,
}

impl SessionManager {
    pub fn new(
        pool: Arc<ContainerPool>,
        log_store: Arc<SessionLogStore>,
        duration_secs: u64,
        rate_limit_per_day: u32,
    ) -> Self {
        Self {
            pool,
            log_store,
            rate_limit_per_day,
            inner: Mutex::new(SessionInner::new(duration_secs)),
        }
    }

    pub async fn check_rate_limit(&self, raw_ip: &str) -> RateLimitStatus {
        let mut inner = self.inner.lock().await;
        inner.roll_date(chrono::Local::now().date_naive());
        inner.rate_limit_status(raw_ip, self.rate_limit_per_day)
    }

    /// Bind a fresh session to a warm container. Returns `Queued` when the
    /// pool has nothing warm; the admission queue retries later.
    pub async fn create_session(
        &self,
        url: &str,
        raw_ip: &str,
    ) -> Result<CreateOutcome, UrlError> {
        let normalized = normalize_url(url)?;

        let session_id = Uuid::new_v4();
        let Some(container) = self.pool.acquire(session_id).await else {
            return Ok(CreateOutcome::Queued);
        };

        let now = Utc::now();
        let session = {
            let mut inner = self.inner.lock().await;
            inner.roll_date(chrono::Local::now().date_naive());

            let session = Session {
                id: session_id,
                container_id: container.id,
                port: container.port,
                url: normalized.clone(),
                anon_ip: anonymize_ip(raw_ip),
                started_at: now,
                expires_at: now + ChronoDuration::seconds(inner.current_duration_secs as i64),
                status: SessionStatus::Active,
                end_reason: None,
                ended_at: None,
            };
            inner.sessions.insert(session_id, session.clone());

            *inner.ip_count_today.entry(raw_ip.to_string()).or_insert(0) += 1;
            inner.sessions_today += 1;
            let active = inner.active_count();
            if active > inner.peak_concurrent {
                inner.peak_concurrent = active;
            }
            session
        };

        info!(
            "Session {} started on port {} ({})",
            session.id, session.port, session.anon_ip
        );

        self.pool.launch_app(&container, &normalized);

        if let Err(e) = self.log_store.record_start(&session).await {
            warn!("Failed to write session start log: {:#}", e);
        }

        Ok(CreateOutcome::Started(session))
    }

    pub async fn get_session(&self, id: Uuid) -> Option<Session> {
        self.inner.lock().await.sessions.get(&id).cloned()
    }

    /// End a session. Idempotent: returns false when the session is unknown
    /// or already finished. The bound container is always released.
    pub async fn end_session(&self, id: Uuid, reason: &str) -> bool {
        let session = {
            let mut inner = self.inner.lock().await;
            inner.finish_session(id, reason, Utc::now())
        };
        let Some(session) = session else {
            return false;
        };

        info!("Session {} ended ({})", id, reason);

        if let Err(e) = self
            .log_store
            .record_end(session.id, reason, session.ended_at.unwrap_or_else(Utc::now))
            .await
        {
            warn!("Failed to write session end log: {:#}", e);
        }

        self.pool.release(session.container_id).await;
        true
    }

    /// Every 5s: expire overdue sessions and prune finished records that the
    /// realtime channel has long since observed.
    pub fn spawn_expiry_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(EXPIRY_TICK);
            loop {
                ticker.tick().await;

                let now = Utc::now();
                let (expired, stale): (Vec<Uuid>, Vec<Uuid>) = {
                    let inner = manager.inner.lock().await;
                    let expired = inner
                        .sessions
                        .values()
                        .filter(|s| s.is_active() && s.expires_at <= now)
                        .map(|s| s.id)
                        .collect();
                    let stale = inner
                        .sessions
                        .values()
                        .filter(|s| {
                            s.ended_at.is_some_and(|t| {
                                (now - t).num_seconds() > TERMINAL_RETENTION_SECS
                            })
                        })
                        .map(|s| s.id)
                        .collect();
                    (expired, stale)
                };

                for id in expired {
                    manager.end_session(id, "expired").await;
                }

                if !stale.is_empty() {
                    let mut inner = manager.inner.lock().await;
                    for id in stale {
                        inner.sessions.remove(&id);
                    }
                }
            }
        });
    }

    pub async fn active_sessions(&self) -> Vec<Session> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub async fn stats(&self) -> SessionStats {
        let inner = self.inner.lock().await;
        SessionStats {
            active_sessions: inner.active_count(),
            sessions_today: inner.sessions_today,
            peak_concurrent: inner.peak_concurrent,
            avg_session_duration_secs: inner.avg_duration_secs(),
            current_duration_secs: inner.current_duration_secs,
            paused: inner.paused,
        }
    }

    pub async fn avg_session_duration_secs(&self) -> u64 {
        self.inner.lock().await.avg_duration_secs()
    }

    pub async fn is_paused(&self) -> bool {
        self.inner.lock().await.paused
    }

    pub async fn set_paused(&self, paused: bool) {
        info!("Session admission {}", if paused { "paused" } else { "resumed" });
        self.inner.lock().await.paused = paused;
    }

    pub async fn set_duration(&self, secs: u64) {
        info!("Session duration set to {}s", secs);
        self.inner.lock().await.current_duration_secs = secs;
    }

    pub async fn block_ip(&self, ip: &str) {
        let mut inner = self.inner.lock().await;
        inner.whitelist.remove(ip);
        inner.blocked.insert(ip.to_string());
    }

    pub async fn unblock_ip(&self, ip: &str) {
        self.inner.lock().await.blocked.remove(ip);
    }

    pub async fn whitelist_ip(&self, ip: &str) {
        let mut inner = self.inner.lock().await;
        inner.blocked.remove(ip);
        inner.whitelist.insert(ip.to_string());
    }

    pub async fn unwhitelist_ip(&self, ip: &str) {
        self.inner.lock().await.whitelist.remove(ip);
    }

    pub async fn clear_limit(&self, ip: &str) {
        self.inner.lock().await.ip_count_today.remove(ip);
    }

    pub fn rate_limit_per_day(&self) -> u32 {
        self.rate_limit_per_day
    }

    /// Policy snapshot for the admin surface: per-IP usage today plus the
    /// block and whitelist sets.
    pub async fn rate_limit_overview(&self) -> RateLimitOverview {
        let inner = self.inner.lock().await;
        let limit = self.rate_limit_per_day;
        RateLimitOverview {
            limit,
            usage_today: inner.ip_count_today.clone(),
            limited_ips: inner
                .ip_count_today
                .iter()
                .filter(|(ip, count)| **count >= limit && !inner.whitelist.contains(*ip))
                .map(|(ip, _)| ip.clone())
                .collect(),
            blocked: inner.blocked.iter().cloned().collect(),
            whitelisted: inner.whitelist.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitOverview {
    pub limit: u32,
    pub usage_today: HashMap<String, u32>,
    pub limited_ips: Vec<String>,
    pub blocked: Vec<String>,
    pub whitelisted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inner() -> SessionInner {
        SessionInner::new(300)
    }

    #[test]
    fn rate_limit_counts_down() {
        let mut state = inner();
        state.ip_count_today.insert("10.0.0.5".into(), 9);

        let status = state.rate_limit_status("10.0.0.5", 10);
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);

        state.ip_count_today.insert("10.0.0.5".into(), 10);
        let status = state.rate_limit_status("10.0.0.5", 10);
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert!(!status.blocked);
    }

    #[test]
    fn blocked_ip_is_always_denied() {
        let mut state = inner();
        state.blocked.insert("10.0.0.5".into());
        let status = state.rate_limit_status("10.0.0.5", 10);
        assert!(!status.allowed);
        assert!(status.blocked);
    }

    #[test]
    fn whitelisted_ip_ignores_the_cap() {
        let mut state = inner();
        state.whitelist.insert("10.0.0.5".into());
        state.ip_count_today.insert("10.0.0.5".into(), 999);
        let status = state.rate_limit_status("10.0.0.5", 10);
        assert!(status.allowed);
    }

    #[test]
    fn date_rollover_resets_counters() {
        let mut state = inner();
        state.ip_count_today.insert("10.0.0.5".into(), 10);
        state.sessions_today = 42;
        state.peak_concurrent = 7;

        let tomorrow = state.counter_date + ChronoDuration::days(1);
        state.roll_date(tomorrow);

        assert!(state.ip_count_today.is_empty());
        assert_eq!(state.sessions_today, 0);
        assert_eq!(state.peak_concurrent, 0);
        assert_eq!(state.counter_date, tomorrow);
    }

    #[test]
    fn same_date_keeps_counters() {
        let mut state = inner();
        state.ip_count_today.insert("10.0.0.5".into(), 3);
        let today = state.counter_date;
        state.roll_date(today);
        assert_eq!(state.ip_count_today.get("10.0.0.5"), Some(&3));
    }

    #[test]
    fn duration_window_caps_at_twenty() {
        let mut state = inner();
        for i in 0..25 {
            state.push_duration(i);
        }
        assert_eq!(state.recent_durations.len(), 20);
        // Oldest five evicted
        assert_eq!(state.recent_durations.front(), Some(&5));
        assert_eq!(state.recent_durations.back(), Some(&24));
    }

    #[test]
    fn avg_duration_falls_back_to_configured() {
        let mut state = inner();
        assert_eq!(state.avg_duration_secs(), 300);

        state.push_duration(100);
        state.push_duration(200);
        assert_eq!(state.avg_duration_secs(), 150);
    }

    fn insert_active(state: &mut SessionInner) -> Uuid {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            container_id: Uuid::new_v4(),
            port: 4000,
            url: "https://example.com".to_string(),
            anon_ip: "10.0.0.*".to_string(),
            started_at: now - ChronoDuration::seconds(40),
            expires_at: now + ChronoDuration::seconds(260),
            status: SessionStatus::Active,
            end_reason: None,
            ended_at: None,
        };
        let id = session.id;
        state.sessions.insert(id, session);
        id
    }

    #[test]
    fn finish_session_is_idempotent() {
        let mut state = inner();
        let id = insert_active(&mut state);
        let now = Utc::now();

        let first = state.finish_session(id, "user_ended", now);
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, SessionStatus::Ended);

        // Second call is a no-op and records nothing further
        assert!(state.finish_session(id, "user_ended", now).is_none());
        assert_eq!(state.recent_durations.len(), 1);
    }

    #[test]
    fn finish_session_records_actual_duration() {
        let mut state = inner();
        let id = insert_active(&mut state);
        let now = Utc::now();

        state.finish_session(id, "abandoned", now).unwrap();
        let recorded = *state.recent_durations.back().unwrap();
        assert!((39..=41).contains(&recorded));
    }

    #[test]
    fn expired_reason_maps_to_expired_status() {
        let mut state = inner();
        let id = insert_active(&mut state);

        let ended = state.finish_session(id, "expired", Utc::now()).unwrap();
        assert_eq!(ended.status, SessionStatus::Expired);
        assert_eq!(ended.end_reason.as_deref(), Some("expired"));
    }

    #[test]
    fn unknown_session_cannot_be_finished() {
        let mut state = inner();
        assert!(state
            .finish_session(Uuid::new_v4(), "expired", Utc::now())
            .is_none());
    }
}
