//! Route table

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::api::handlers;
use crate::AppState;

/// Long-polls are capped at 60s, leave room on top of that
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/settings", get(handlers::get_settings))
        .route(
            "/api/session",
            get(handlers::session_status)
                .post(handlers::open_session)
                .delete(handlers::close_session),
        )
        .route("/api/generate", post(handlers::generate))
        .route("/api/jobs", get(handlers::list_jobs))
        .route(
            "/api/jobs/:id",
            get(handlers::get_job).delete(handlers::cancel_job),
        )
        .route("/api/jobs/:id/images/:index", get(handlers::get_image))
        .route(
            "/api/jobs/:id/images/:index/save",
            post(handlers::save_image),
        )
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
