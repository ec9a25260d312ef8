use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::realtime::ws_upgrade_handler;
use crate::server::handlers::{admin, queue, sessions, system};
use crate::server::logging_middleware::request_logging_middleware;
use crate::server::middleware::admin_auth_middleware;
use crate::server::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/session", post(sessions::create_session))
        .route("/session/rate-limit/status", get(sessions::rate_limit_status))
        .route(
            "/session/{id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route(
            "/queue/{id}",
            get(queue::get_queue_entry).delete(queue::leave_queue),
        )
        .route("/health", get(system::health))
        .route("/metrics", get(system::scrape_metrics));

    let admin_routes = Router::new()
        .route("/sessions", get(admin::list_sessions))
        .route("/sessions/{id}", axum::routing::delete(admin::kill_session))
        .route("/queue", get(admin::list_queue))
        .route("/queue/drain", post(admin::drain_queue))
        .route("/pool", get(admin::pool_status))
        .route("/pool/restart", post(admin::restart_pool))
        .route("/stats", get(admin::stats))
        .route("/history", get(admin::history))
        .route("/rate-limits", get(admin::rate_limits))
        .route("/ip/block", post(admin::block_ip))
        .route("/ip/unblock", post(admin::unblock_ip))
        .route("/ip/whitelist", post(admin::whitelist_ip))
        .route("/ip/unwhitelist", post(admin::unwhitelist_ip))
        .route("/ip/clear-limit", post(admin::clear_limit))
        .route("/pause", post(admin::pause))
        .route("/resume", post(admin::resume))
        .route("/config", put(admin::update_config))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    let api_routes = public_routes.merge(Router::new().nest("/admin", admin_routes));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_upgrade_handler))
        .layer(cors_layer(&state.config.frontend_url))
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    match frontend_url.parse::<HeaderValue>() {
        Ok(origin) => layer.allow_origin(origin),
        Err(_) => {
            warn!("Invalid FRONTEND_URL {:?}, CORS origin left unset", frontend_url);
            layer
        }
    }
}
