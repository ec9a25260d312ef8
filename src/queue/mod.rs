use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::docker::ContainerPool;
use crate::session::{CreateOutcome, SessionManager};

const WORKER_TICK: Duration = Duration::from_millis(500);
/// Short pause between `preparing` and `connecting` so the queue page can
/// render the progression.
const UX_DELAY: Duration = Duration::from_millis(500);
/// Nominal parallelism used for the wait estimate.
const ESTIMATE_PARALLELISM: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Preparing,
    Connecting,
    Ready,
    RateLimited,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub id: Uuid,
    pub url: String,
    #[serde(skip_serializing)]
    pub raw_ip: String,
    /// 1-based position among waiting entries; 0 once no longer waiting.
    pub position: usize,
    pub status: QueueStatus,
    pub session_id: Option<Uuid>,
    pub port: Option<u16>,
    pub created_at: DateTime<Utc>,
}

/// Snapshot pushed to subscribers on every status change.
#[derive(Debug, Clone, Serialize)]
pub struct QueueUpdate {
    pub entry: QueueEntry,
    pub total_in_queue: usize,
    pub estimated_wait_secs: u64,
}

pub type QueueCallback = Arc<dyn Fn(QueueUpdate) + Send + Sync>;

#[derive(Default)]
struct QueueInner {
    waiting: VecDeque<Uuid>,
    entries: HashMap<Uuid, QueueEntry>,
    ip_map: HashMap<String, Uuid>,
    callbacks: HashMap<Uuid, QueueCallback>,
}

impl QueueInner {
    /// Append a new entry, or coalesce onto the caller's existing waiting
    /// entry (URL overwritten, position untouched).
    fn enqueue(&mut self, url: &str, raw_ip: &str) -> (QueueEntry, bool) {
        if let Some(&existing) = self.ip_map.get(raw_ip) {
            if let Some(entry) = self.entries.get_mut(&existing) {
                if entry.status == QueueStatus::Waiting {
                    entry.url = url.to_string();
                    return (entry.clone(), false);
                }
            }
        }

        let entry = QueueEntry {
            id: Uuid::new_v4(),
            url: url.to_string(),
            raw_ip: raw_ip.to_string(),
            position: self.waiting.len() + 1,
            status: QueueStatus::Waiting,
            session_id: None,
            port: None,
            created_at: Utc::now(),
        };
        self.waiting.push_back(entry.id);
        self.ip_map.insert(raw_ip.to_string(), entry.id);
        self.entries.insert(entry.id, entry.clone());
        (entry, true)
    }

    /// Recompute 1-based positions over the waiting order.
    fn reindex(&mut self) {
        for (idx, id) in self.waiting.iter().enumerate() {
            if let Some(entry) = self.entries.get_mut(id) {
                entry.position = idx + 1;
            }
        }
    }

    fn pop_front(&mut self) -> Option<QueueEntry> {
        let id = self.waiting.pop_front()?;
        self.reindex();
        let entry = self.entries.get_mut(&id)?;
        entry.position = 0;
        self.ip_map.remove(&entry.raw_ip);
        Some(entry.clone())
    }

    /// Put an entry back at the head after a bounded failure. Returns false
    /// when the entry was dropped instead: the same IP enqueued a fresh
    /// entry while this one was in flight, and that newer waiting entry
    /// keeps the per-IP slot.
    fn push_front(&mut self, id: Uuid) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };

        if self
            .ip_map
            .get(&entry.raw_ip)
            .is_some_and(|other| *other != id)
        {
            self.forget(id);
            return false;
        }

        entry.status = QueueStatus::Waiting;
        entry.session_id = None;
        entry.port = None;
        self.ip_map.insert(entry.raw_ip.clone(), id);
        self.waiting.push_front(id);
        self.reindex();
        true
    }

    fn remove_waiting(&mut self, id: Uuid) -> bool {
        let Some(pos) = self.waiting.iter().position(|&w| w == id) else {
            return false;
        };
        self.waiting.remove(pos);
        if let Some(entry) = self.entries.get(&id) {
            self.ip_map.remove(&entry.raw_ip);
        }
        self.reindex();
        true
    }

    fn forget(&mut self, id: Uuid) {
        self.entries.remove(&id);
        self.callbacks.remove(&id);
    }

    fn set_status(&mut self, id: Uuid, status: QueueStatus) -> Option<QueueEntry> {
        let entry = self.entries.get_mut(&id)?;
        entry.status = status;
        Some(entry.clone())
    }

    /// Terminate and purge every waiting entry, returning the terminal
    /// snapshots with their callbacks so the caller can notify.
    fn drain_waiting(&mut self) -> Vec<(QueueEntry, Option<QueueCallback>)> {
        let ids: Vec<Uuid> = self.waiting.drain(..).collect();
        self.ip_map.clear();

        ids.iter()
            .filter_map(|id| {
                let mut entry = self.entries.remove(id)?;
                entry.status = QueueStatus::RateLimited;
                entry.position = 0;
                let callback = self.callbacks.remove(id);
                Some((entry, callback))
            })
            .collect()
    }
}

/// FIFO admission with per-IP coalescing. A background worker walks the head
/// entry through `waiting → preparing → connecting → ready` whenever warm
/// capacity exists.
pub struct AdmissionQueue {
    pool: Arc<ContainerPool>,
    sessions: Arc<SessionManager>,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl AdmissionQueue {
    pub fn new(pool: Arc<ContainerPool>, sessions: Arc<SessionManager>) -> Self {
        Self {
            pool,
            sessions,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    pub async fn enqueue(&self, url: &str, raw_ip: &str) -> QueueEntry {
        let (entry, created) = {
            let mut inner = self.inner.lock().await;
            inner.enqueue(url, raw_ip)
        };

        if created {
            info!(
                "Queue entry {} admitted at position {}",
                entry.id, entry.position
            );
            self.notify.notify_one();
        } else {
            debug!("Queue entry {} coalesced", entry.id);
        }
        entry
    }

    pub async fn get(&self, id: Uuid) -> Option<QueueEntry> {
        self.inner.lock().await.entries.get(&id).cloned()
    }

    /// Register a subscriber for status changes. Returns false when the
    /// entry is unknown (already terminal or never existed).
    pub async fn subscribe(&self, id: Uuid, callback: QueueCallback) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.entries.contains_key(&id) {
            return false;
        }
        inner.callbacks.insert(id, callback);
        true
    }

    pub async fn leave(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().await;
        let was_waiting = inner.remove_waiting(id);
        let known = inner.entries.contains_key(&id);
        inner.forget(id);
        was_waiting || known
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.waiting.len()
    }

    /// Waiting entries in queue order, for the admin surface.
    pub async fn waiting_entries(&self) -> Vec<QueueEntry> {
        let inner = self.inner.lock().await;
        inner
            .waiting
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    /// Zero whenever warm capacity exists; otherwise a batch estimate over
    /// the nominal parallelism.
    pub async fn estimated_wait_secs(&self) -> u64 {
        if self.pool.warm_count().await > 0 {
            return 0;
        }
        let len = self.len().await;
        let batches = len.div_ceil(ESTIMATE_PARALLELISM) as u64;
        batches * self.sessions.avg_session_duration_secs().await
    }

    /// Terminate every waiting entry and purge the registries. In-flight
    /// entries (already popped) are unaffected.
    pub async fn drain(&self) -> usize {
        let terminated = {
            let mut inner = self.inner.lock().await;
            inner.drain_waiting()
        };

        let count = terminated.len();
        info!("Queue drained: {} entries terminated", count);

        for (entry, callback) in terminated {
            self.emit(callback.as_ref(), entry).await;
        }
        count
    }

    pub fn spawn_worker(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(WORKER_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = queue.notify.notified() => {}
                }
                queue.process_next().await;
            }
        });
    }

    /// Advance the head entry toward readiness. Bounded failures put it back
    /// at the front; hard failures drop it.
    async fn process_next(&self) {
        if self.pool.warm_count().await == 0 {
            return;
        }

        let popped = {
            let mut inner = self.inner.lock().await;
            inner.pop_front()
        };
        let Some(mut entry) = popped else {
            return;
        };

        // Policy may have changed while the entry sat in line.
        let limit = self.sessions.check_rate_limit(&entry.raw_ip).await;
        if !limit.allowed {
            info!("Queue entry {} rate-limited at promotion", entry.id);
            entry.status = QueueStatus::RateLimited;
            let callback = self.take_callback(entry.id).await;
            self.emit(callback.as_ref(), entry).await;
            return;
        }

        entry = self
            .transition(entry.id, QueueStatus::Preparing)
            .await
            .unwrap_or(entry);
        let callback = self.current_callback(entry.id).await;
        self.emit(callback.as_ref(), entry.clone()).await;

        tokio::time::sleep(UX_DELAY).await;

        entry = self
            .transition(entry.id, QueueStatus::Connecting)
            .await
            .unwrap_or(entry);
        let callback = self.current_callback(entry.id).await;
        self.emit(callback.as_ref(), entry.clone()).await;

        match self.sessions.create_session(&entry.url, &entry.raw_ip).await {
            Ok(CreateOutcome::Started(session)) => {
                entry.status = QueueStatus::Ready;
                entry.session_id = Some(session.id);
                entry.port = Some(session.port);
                let callback = self.take_callback(entry.id).await;
                info!("Queue entry {} ready: session {}", entry.id, session.id);
                self.emit(callback.as_ref(), entry).await;
            }
            Ok(CreateOutcome::Queued) => {
                // Capacity vanished between the warm check and the acquire.
                let requeued = {
                    let mut inner = self.inner.lock().await;
                    inner.push_front(entry.id)
                };
                if requeued {
                    debug!("No capacity for entry {}, requeued at front", entry.id);
                } else {
                    debug!(
                        "Entry {} superseded by a newer submission from its IP, dropped",
                        entry.id
                    );
                }
            }
            Err(e) => {
                warn!("Dropping queue entry {}: {}", entry.id, e);
                let mut inner = self.inner.lock().await;
                inner.forget(entry.id);
            }
        }
    }

    async fn transition(&self, id: Uuid, status: QueueStatus) -> Option<QueueEntry> {
        self.inner.lock().await.set_status(id, status)
    }

    async fn current_callback(&self, id: Uuid) -> Option<QueueCallback> {
        self.inner.lock().await.callbacks.get(&id).cloned()
    }

    /// Detach the callback and drop the entry: terminal states are fired
    /// exactly once and then forgotten.
    async fn take_callback(&self, id: Uuid) -> Option<QueueCallback> {
        let mut inner = self.inner.lock().await;
        let callback = inner.callbacks.get(&id).cloned();
        inner.forget(id);
        callback
    }

    /// Callbacks run without the queue lock, on defensive copies.
    async fn emit(&self, callback: Option<&QueueCallback>, entry: QueueEntry) {
        let Some(callback) = callback else {
            return;
        };
        let update = QueueUpdate {
            total_in_queue: self.len().await,
            estimated_wait_secs: self.estimated_wait_secs().await,
            entry,
        };
        callback(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_assigns_fifo_positions() {
        let mut inner = QueueInner::default();
        let (a, created_a) = inner.enqueue("https://a.example", "10.0.0.1");
        let (b, created_b) = inner.enqueue("https://b.example", "10.0.0.2");

        assert!(created_a && created_b);
        assert_eq!(a.position, 1);
        assert_eq!(b.position, 2);
    }

    #[test]
    fn same_ip_coalesces_and_keeps_position() {
        let mut inner = QueueInner::default();
        let (first, _) = inner.enqueue("https://a.example", "10.0.0.1");
        inner.enqueue("https://other.example", "10.0.0.2");
        let (second, created) = inner.enqueue("https://b.example", "10.0.0.1");

        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.position, 1);
        assert_eq!(second.url, "https://b.example");
        assert_eq!(inner.waiting.len(), 2);
    }

    #[test]
    fn pop_front_reindexes_remaining() {
        let mut inner = QueueInner::default();
        inner.enqueue("https://a.example", "10.0.0.1");
        let (b, _) = inner.enqueue("https://b.example", "10.0.0.2");
        let (c, _) = inner.enqueue("https://c.example", "10.0.0.3");

        let popped = inner.pop_front().unwrap();
        assert_eq!(popped.position, 0);
        assert_eq!(inner.entries[&b.id].position, 1);
        assert_eq!(inner.entries[&c.id].position, 2);
        // Popped IP can enqueue again
        assert!(!inner.ip_map.contains_key("10.0.0.1"));
    }

    #[test]
    fn push_front_restores_head_position() {
        let mut inner = QueueInner::default();
        let (a, _) = inner.enqueue("https://a.example", "10.0.0.1");
        inner.enqueue("https://b.example", "10.0.0.2");

        let popped = inner.pop_front().unwrap();
        assert_eq!(popped.id, a.id);

        assert!(inner.push_front(a.id));
        assert_eq!(inner.entries[&a.id].position, 1);
        assert_eq!(inner.entries[&a.id].status, QueueStatus::Waiting);
        assert_eq!(inner.waiting.front(), Some(&a.id));
        assert_eq!(inner.ip_map.get("10.0.0.1"), Some(&a.id));
    }

    #[test]
    fn push_front_drops_entry_superseded_by_same_ip() {
        let mut inner = QueueInner::default();
        let (a, _) = inner.enqueue("https://a.example", "10.0.0.1");

        // Worker takes A in flight; the same IP submits again, creating B.
        inner.pop_front().unwrap();
        let (b, created) = inner.enqueue("https://b.example", "10.0.0.1");
        assert!(created);
        assert_ne!(a.id, b.id);

        // Requeueing A must not produce a second waiting entry for the IP.
        assert!(!inner.push_front(a.id));
        assert!(!inner.entries.contains_key(&a.id));
        assert_eq!(inner.waiting.len(), 1);
        assert_eq!(inner.ip_map.get("10.0.0.1"), Some(&b.id));
        assert_eq!(inner.entries[&b.id].position, 1);
    }

    #[test]
    fn remove_waiting_closes_the_gap() {
        let mut inner = QueueInner::default();
        inner.enqueue("https://a.example", "10.0.0.1");
        let (b, _) = inner.enqueue("https://b.example", "10.0.0.2");
        let (c, _) = inner.enqueue("https://c.example", "10.0.0.3");

        assert!(inner.remove_waiting(b.id));
        assert_eq!(inner.entries[&c.id].position, 2);
        assert!(!inner.remove_waiting(b.id));
    }

    #[test]
    fn drain_terminates_all_waiting_entries() {
        let mut inner = QueueInner::default();
        inner.enqueue("https://a.example", "10.0.0.1");
        inner.enqueue("https://b.example", "10.0.0.2");

        let drained = inner.drain_waiting();
        assert_eq!(drained.len(), 2);
        assert!(drained
            .iter()
            .all(|(e, _)| e.status == QueueStatus::RateLimited && e.position == 0));
        assert!(inner.waiting.is_empty());
        assert!(inner.entries.is_empty());
        assert!(inner.ip_map.is_empty());

        // Draining an empty queue is a no-op
        assert!(inner.drain_waiting().is_empty());
    }

    #[test]
    fn positions_stay_contiguous_after_mixed_mutations() {
        let mut inner = QueueInner::default();
        let ids: Vec<Uuid> = (0..5)
            .map(|i| {
                inner
                    .enqueue(&format!("https://{}.example", i), &format!("10.0.0.{}", i))
                    .0
                    .id
            })
            .collect();

        inner.pop_front();
        inner.remove_waiting(ids[2]);
        inner.push_front(ids[0]);

        let positions: Vec<usize> = inner
            .waiting
            .iter()
            .map(|id| inner.entries[id].position)
            .collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
    }
}
