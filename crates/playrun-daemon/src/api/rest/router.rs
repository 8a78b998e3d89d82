//! API Router configuration

use super::handlers;
use super::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main API router
pub fn create_router(state: AppState, enable_cors: bool) -> Router {
    let api_routes = Router::new()
        // Health
        .route("/health", get(handlers::health_check))
        // Jobs
        .route("/playbooks", get(handlers::list_playbooks))
        .route("/playbooks/:name", post(handlers::run_playbook))
        .route("/workflows", post(handlers::run_workflow))
        // Runs
        .route("/plays", get(handlers::list_plays))
        .route("/plays/:id", get(handlers::get_play).delete(handlers::kill_play))
        .route("/plays/:id/log", get(handlers::get_log))
        .route("/plays/:id/events", get(handlers::get_events))
        .route("/plays/:id/stream", get(handlers::stream_play))
        // Events reported by the running tool
        .route("/listener/playbook", post(handlers::playbook_event));

    let router = Router::new()
        .nest("/api/v2", api_routes)
        .layer(TraceLayer::new_for_http());

    let router = if enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}
