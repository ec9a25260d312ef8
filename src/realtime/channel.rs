use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};
use uuid::Uuid;

use super::events::ServerMessage;
use crate::session::SessionManager;

const TIMER_TICK: Duration = Duration::from_secs(1);
/// Grace period before a client-less session is terminated.
const ABANDON_GRACE: Duration = Duration::from_secs(35);
const WARNING_AT_SECS: i64 = 30;

struct ClientHandle {
    sender: UnboundedSender<String>,
    session_id: Option<Uuid>,
}

#[derive(Default)]
struct SessionBindings {
    clients: HashSet<Uuid>,
    viewers: HashSet<Uuid>,
    primary: Option<Uuid>,
    warned: bool,
    abandon_task: Option<JoinHandle<()>>,
}

impl SessionBindings {
    /// The 30s warning fires exactly once per session.
    fn warning_due(&mut self, time_remaining: i64) -> bool {
        if time_remaining <= WARNING_AT_SECS && !self.warned {
            self.warned = true;
            true
        } else {
            false
        }
    }
}

/// What a bind changed, so the caller can emit outside the lock.
struct BindResult {
    viewer_count: usize,
    /// Prior primary that must receive a takeover signal.
    demoted: Option<Uuid>,
    /// Primary to push the new viewer count to (viewer joins only).
    notify_primary: Option<Uuid>,
    /// Prior session left with no clients by this re-bind.
    left_empty: Option<Uuid>,
}

struct DetachResult {
    /// Session this client was the last member of.
    empty_session: Option<Uuid>,
    /// Primary to push the new viewer count to.
    viewer_update: Option<(Uuid, usize)>,
}

#[derive(Default)]
struct ChannelInner {
    clients: HashMap<Uuid, ClientHandle>,
    bindings: HashMap<Uuid, SessionBindings>,
}

impl ChannelInner {
    fn sender_of(&self, client_id: Uuid) -> Option<UnboundedSender<String>> {
        self.clients.get(&client_id).map(|c| c.sender.clone())
    }

    fn senders_of(&self, ids: &HashSet<Uuid>) -> Vec<UnboundedSender<String>> {
        ids.iter().filter_map(|id| self.sender_of(*id)).collect()
    }

    /// Remove a client from a session's projections. Does not touch the
    /// client handle itself.
    fn remove_from_binding(&mut self, client_id: Uuid, session_id: Uuid) -> DetachResult {
        let mut result = DetachResult {
            empty_session: None,
            viewer_update: None,
        };

        let Some(binding) = self.bindings.get_mut(&session_id) else {
            return result;
        };

        binding.clients.remove(&client_id);
        let was_viewer = binding.viewers.remove(&client_id);
        if binding.primary == Some(client_id) {
            binding.primary = None;
        }

        if binding.clients.is_empty() {
            result.empty_session = Some(session_id);
        } else if was_viewer {
            if let Some(primary) = binding.primary {
                result.viewer_update = Some((primary, binding.viewers.len()));
            }
        }
        result
    }

    /// Bind a client to a session, handling re-binds from another session
    /// and primary takeover. Any pending abandonment is cancelled.
    fn bind(&mut self, client_id: Uuid, session_id: Uuid, viewer: bool) -> Option<BindResult> {
        let previous_session = self.clients.get_mut(&client_id)?.session_id.replace(session_id);

        // A client is bound to at most one session; detach it from any prior
        // binding so that session's abandonment still works.
        let left_empty = previous_session
            .filter(|old| *old != session_id)
            .and_then(|old| self.remove_from_binding(client_id, old).empty_session);

        let binding = self.bindings.entry(session_id).or_default();
        if let Some(task) = binding.abandon_task.take() {
            task.abort();
            debug!("Abandonment cancelled for session {}", session_id);
        }
        binding.clients.insert(client_id);

        let (viewer_count, demoted, notify_primary) = if viewer {
            binding.viewers.insert(client_id);
            (binding.viewers.len(), None, binding.primary)
        } else {
            let previous = binding.primary.filter(|p| *p != client_id);
            binding.primary = Some(client_id);
            binding.viewers.remove(&client_id);
            (binding.viewers.len(), previous, None)
        };

        Some(BindResult {
            viewer_count,
            demoted,
            notify_primary,
            left_empty,
        })
    }

    fn detach_client(&mut self, client_id: Uuid) -> DetachResult {
        let session_id = self
            .clients
            .remove(&client_id)
            .and_then(|handle| handle.session_id);

        match session_id {
            Some(session_id) => self.remove_from_binding(client_id, session_id),
            None => DetachResult {
                empty_session: None,
                viewer_update: None,
            },
        }
    }
}

/// Per-session client projections and the 1s broadcast loop. State changes
/// happen under one mutex; broadcast sweeps snapshot under it and emit
/// outside, while join replies are queued under it so the first frame a
/// joiner sees is its `session:joined`.
pub struct RealtimeChannel {
    sessions: Arc<SessionManager>,
    inner: Mutex<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            inner: Mutex::new(ChannelInner::default()),
        }
    }

    pub async fn register_client(&self, client_id: Uuid, sender: UnboundedSender<String>) {
        let mut inner = self.inner.lock().await;
        inner.clients.insert(
            client_id,
            ClientHandle {
                sender,
                session_id: None,
            },
        );
    }

    /// Drop a client and, when it was the session's last one, start the
    /// abandonment grace timer.
    pub async fn unregister_client(self: &Arc<Self>, client_id: Uuid) {
        let (result, viewer_sender) = {
            let mut inner = self.inner.lock().await;
            let result = inner.detach_client(client_id);
            let viewer_sender = result
                .viewer_update
                .and_then(|(primary, count)| inner.sender_of(primary).map(|s| (s, count)));
            (result, viewer_sender)
        };

        if let Some((sender, count)) = viewer_sender {
            Self::deliver(&sender, &ServerMessage::SessionViewerCount { count });
        }

        if let Some(session_id) = result.empty_session {
            debug!("Session {} lost its last client", session_id);
            self.schedule_abandonment(session_id).await;
        }
    }

    /// Bind a client to a session as viewer or controller. A controller join
    /// demotes any existing primary with a takeover signal; any join cancels
    /// a pending abandonment.
    pub async fn join_session(self: &Arc<Self>, client_id: Uuid, session_id: Uuid, viewer: bool) {
        let session = self.sessions.get_session(session_id).await;
        let Some(session) = session.filter(|s| s.is_active()) else {
            let sender = self.inner.lock().await.sender_of(client_id);
            if let Some(sender) = sender {
                Self::deliver(
                    &sender,
                    &ServerMessage::SessionError {
                        error: "Session is not active".to_string(),
                    },
                );
            }
            return;
        };

        let time_remaining = session.time_remaining_secs();

        // The joined frame is queued into the client's mpsc while the lock
        // is still held. A timer tick can only see the new binding under
        // this same lock, so `session:joined` is always the first frame a
        // joiner receives. The mpsc enqueue never blocks.
        let left_empty = {
            let mut inner = self.inner.lock().await;
            let Some(result) = inner.bind(client_id, session_id, viewer) else {
                return; // client vanished before the join was processed
            };

            // Demotion goes out before the new primary's joined so the old
            // connection sees the takeover first.
            if let Some(sender) = result.demoted.and_then(|p| inner.sender_of(p)) {
                Self::deliver(&sender, &ServerMessage::SessionTakeover);
            }
            if let Some(sender) = inner.sender_of(client_id) {
                Self::deliver(
                    &sender,
                    &ServerMessage::SessionJoined {
                        port: session.port,
                        time_remaining,
                        is_primary: !viewer,
                        is_viewer: viewer,
                        viewer_count: result.viewer_count,
                    },
                );
            }
            if let Some(sender) = result.notify_primary.and_then(|p| inner.sender_of(p)) {
                Self::deliver(
                    &sender,
                    &ServerMessage::SessionViewerCount {
                        count: result.viewer_count,
                    },
                );
            }
            result.left_empty
        };

        info!(
            "Client {} joined session {} as {}",
            client_id,
            session_id,
            if viewer { "viewer" } else { "primary" }
        );

        if let Some(old) = left_empty {
            self.schedule_abandonment(old).await;
        }
    }

    /// Push the terminal event to every bound client and drop the bindings.
    /// Used by admin kill and user-initiated end; expiry is picked up by the
    /// timer loop instead.
    pub async fn notify_session_ended(&self, session_id: Uuid, reason: &str) {
        let senders = {
            let mut inner = self.inner.lock().await;
            let Some(binding) = inner.bindings.remove(&session_id) else {
                return;
            };
            if let Some(task) = binding.abandon_task {
                task.abort();
            }
            for client_id in &binding.clients {
                if let Some(handle) = inner.clients.get_mut(client_id) {
                    handle.session_id = None;
                }
            }
            inner.senders_of(&binding.clients)
        };

        let message = ServerMessage::SessionEnded {
            reason: reason.to_string(),
        };
        for sender in senders {
            Self::deliver(&sender, &message);
        }
    }

    /// Session ids currently inside the abandonment grace window. The admin
    /// pool view reports their containers as reconnecting.
    pub async fn reconnecting_sessions(&self) -> HashSet<Uuid> {
        let inner = self.inner.lock().await;
        inner
            .bindings
            .iter()
            .filter(|(_, b)| b.abandon_task.is_some() && b.clients.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn spawn_timer_loop(self: &Arc<Self>) {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(TIMER_TICK);
            loop {
                ticker.tick().await;
                channel.broadcast_tick().await;
            }
        });
    }

    /// One broadcast pass over every tracked session.
    async fn broadcast_tick(&self) {
        let tracked: Vec<Uuid> = {
            let inner = self.inner.lock().await;
            inner.bindings.keys().copied().collect()
        };

        for session_id in tracked {
            let session = match self.sessions.get_session(session_id).await {
                Some(s) if s.is_active() => s,
                other => {
                    let reason = other
                        .and_then(|s| s.end_reason)
                        .unwrap_or_else(|| "expired".to_string());
                    self.notify_session_ended(session_id, &reason).await;
                    continue;
                }
            };
            let time_remaining = session.time_remaining_secs();

            let (senders, warn_now) = {
                let mut inner = self.inner.lock().await;
                let Some(binding) = inner.bindings.get_mut(&session_id) else {
                    continue;
                };
                let warn_now = binding.warning_due(time_remaining);
                let clients = binding.clients.clone();
                (inner.senders_of(&clients), warn_now)
            };

            let timer = ServerMessage::SessionTimer { time_remaining };
            for sender in &senders {
                Self::deliver(sender, &timer);
            }
            if warn_now {
                let warning = ServerMessage::SessionWarning {
                    seconds_left: WARNING_AT_SECS,
                };
                for sender in &senders {
                    Self::deliver(sender, &warning);
                }
            }
        }
    }

    async fn schedule_abandonment(self: &Arc<Self>, session_id: Uuid) {
        let channel = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(ABANDON_GRACE).await;
            channel.finish_abandonment(session_id).await;
        });

        let mut inner = self.inner.lock().await;
        match inner.bindings.get_mut(&session_id) {
            Some(binding) if binding.clients.is_empty() => {
                if let Some(old) = binding.abandon_task.replace(task) {
                    old.abort();
                }
            }
            // A client re-joined before we got the lock, or the session is
            // already gone.
            _ => task.abort(),
        }
    }

    async fn finish_abandonment(&self, session_id: Uuid) {
        let still_empty = {
            let mut inner = self.inner.lock().await;
            match inner.bindings.get(&session_id) {
                Some(binding) if binding.clients.is_empty() => {
                    inner.bindings.remove(&session_id);
                    true
                }
                _ => false,
            }
        };

        if still_empty {
            info!("Session {} abandoned by its clients", session_id);
            self.sessions.end_session(session_id, "abandoned").await;
        }
    }

    /// Emission failures (closed client) must never abort a broadcast.
    fn deliver(sender: &UnboundedSender<String>, message: &ServerMessage) {
        if sender.send(message.to_json()).is_err() {
            debug!("Dropped event for closed client");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn add_client(inner: &mut ChannelInner) -> Uuid {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx); // keep the channel open for the test
        let id = Uuid::new_v4();
        inner.clients.insert(
            id,
            ClientHandle {
                sender: tx,
                session_id: None,
            },
        );
        id
    }

    #[test]
    fn controller_join_takes_over_previous_primary() {
        let mut inner = ChannelInner::default();
        let session = Uuid::new_v4();
        let first = add_client(&mut inner);
        let second = add_client(&mut inner);

        let result = inner.bind(first, session, false).unwrap();
        assert_eq!(result.demoted, None);

        let result = inner.bind(second, session, false).unwrap();
        assert_eq!(result.demoted, Some(first));
        assert_eq!(inner.bindings[&session].primary, Some(second));
        // The demoted client stays connected and bound
        assert!(inner.bindings[&session].clients.contains(&first));
    }

    #[test]
    fn rejoining_primary_is_not_demoted() {
        let mut inner = ChannelInner::default();
        let session = Uuid::new_v4();
        let client = add_client(&mut inner);

        inner.bind(client, session, false).unwrap();
        let result = inner.bind(client, session, false).unwrap();
        assert_eq!(result.demoted, None);
    }

    #[test]
    fn viewer_join_notifies_primary_with_count() {
        let mut inner = ChannelInner::default();
        let session = Uuid::new_v4();
        let primary = add_client(&mut inner);
        let viewer = add_client(&mut inner);

        inner.bind(primary, session, false).unwrap();
        let result = inner.bind(viewer, session, true).unwrap();

        assert_eq!(result.viewer_count, 1);
        assert_eq!(result.notify_primary, Some(primary));
        assert_eq!(inner.bindings[&session].primary, Some(primary));
    }

    #[test]
    fn promoting_a_viewer_clears_its_viewer_slot() {
        let mut inner = ChannelInner::default();
        let session = Uuid::new_v4();
        let client = add_client(&mut inner);

        inner.bind(client, session, true).unwrap();
        let result = inner.bind(client, session, false).unwrap();

        assert_eq!(result.viewer_count, 0);
        assert!(inner.bindings[&session].viewers.is_empty());
        assert_eq!(inner.bindings[&session].primary, Some(client));
    }

    #[test]
    fn detaching_last_client_reports_empty_session() {
        let mut inner = ChannelInner::default();
        let session = Uuid::new_v4();
        let client = add_client(&mut inner);
        inner.bind(client, session, false).unwrap();

        let result = inner.detach_client(client);
        assert_eq!(result.empty_session, Some(session));
        assert!(!inner.clients.contains_key(&client));
    }

    #[test]
    fn detaching_a_viewer_updates_the_primary() {
        let mut inner = ChannelInner::default();
        let session = Uuid::new_v4();
        let primary = add_client(&mut inner);
        let viewer = add_client(&mut inner);
        inner.bind(primary, session, false).unwrap();
        inner.bind(viewer, session, true).unwrap();

        let result = inner.detach_client(viewer);
        assert_eq!(result.empty_session, None);
        assert_eq!(result.viewer_update, Some((primary, 0)));
    }

    #[test]
    fn rebinding_to_another_session_leaves_the_old_one() {
        let mut inner = ChannelInner::default();
        let session_a = Uuid::new_v4();
        let session_b = Uuid::new_v4();
        let client = add_client(&mut inner);

        inner.bind(client, session_a, false).unwrap();
        let result = inner.bind(client, session_b, false).unwrap();

        assert_eq!(result.left_empty, Some(session_a));
        assert!(inner.bindings[&session_a].clients.is_empty());
        assert!(inner.bindings[&session_b].clients.contains(&client));
    }

    #[test]
    fn warning_fires_exactly_once() {
        let mut binding = SessionBindings::default();
        assert!(!binding.warning_due(31));
        assert!(binding.warning_due(30));
        assert!(!binding.warning_due(29));
        assert!(!binding.warning_due(30));
    }
}
