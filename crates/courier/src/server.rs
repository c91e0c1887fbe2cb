use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::timeout::TimeoutLayer;

use crate::handlers;
use crate::publisher::EventPublisher;
use crate::queue::SuspendedQueue;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<EventPublisher>,
    pub suspended: Arc<SuspendedQueue>,
}

pub fn build_app(state: AppState, request_timeout_secs: u64) -> Router {
    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/version", get(handlers::version))
        .route("/ingress/events", post(handlers::publish_event))
        .route(
            "/admin/suspended-events/reprocess",
            post(handlers::reprocess_suspended_events),
        )
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_secs),
        ))
}
