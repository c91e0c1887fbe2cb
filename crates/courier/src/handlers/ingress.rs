//! Generic ingress handler.
//!
//! Platform webhooks normally run in their own gateway processes and publish
//! through [`crate::publisher::EventPublisher`] directly; this endpoint is
//! the HTTP equivalent for integrations that already produce normalized
//! events (internal tools, schedulers, tests).

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::event::Event;
use crate::response;
use crate::server::AppState;

#[derive(Deserialize)]
pub struct PublishRequest {
    #[serde(flatten)]
    event: Event,
    /// When set, the event is scheduled instead of delivered immediately.
    #[serde(default)]
    deliver_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct PublishResponse {
    id: String,
    status: &'static str,
}

/// POST /ingress/events
pub async fn publish_event(
    State(state): State<AppState>,
    Json(req): Json<PublishRequest>,
) -> Response {
    if req.event.source.is_empty() {
        return response::bad_request("source must not be empty").into_response();
    }

    let id = req.event.id.clone();
    let result = match req.deliver_at {
        Some(deliver_at) => state.publisher.publish_scheduled(req.event, deliver_at).await,
        None => state.publisher.publish(req.event).await,
    };
    match result {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(PublishResponse {
                id,
                status: "queued",
            }),
        )
            .into_response(),
        Err(e) => {
            warn!(event = %id, error = %e, "ingress publish failed");
            response::internal_error(format!("failed to publish event: {e}")).into_response()
        }
    }
}
