pub mod error;
pub mod handlers;
pub mod logging_middleware;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use crate::config::Config;
use crate::docker::ContainerPool;
use crate::logstore::SessionLogStore;
use crate::queue::AdmissionQueue;
use crate::realtime::RealtimeChannel;
use crate::session::SessionManager;

/// Shared application state injected into every handler.
pub struct AppState {
    pub config: Config,
    pub pool: Arc<ContainerPool>,
    pub sessions: Arc<SessionManager>,
    pub queue: Arc<AdmissionQueue>,
    pub realtime: Arc<RealtimeChannel>,
    pub log_store: Arc<SessionLogStore>,
}
