//! Admin HTTP handlers.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::response;
use crate::server::AppState;

#[derive(Deserialize)]
pub struct ReprocessQuery {
    #[serde(default)]
    user_id: String,
}

#[derive(Serialize)]
pub struct ReprocessResponse {
    message: &'static str,
}

/// POST /admin/suspended-events/reprocess?user_id=...
///
/// Kicks off a background replay of the user's suspended backlog and returns
/// immediately; progress is visible in the logs. Intended to be called by
/// the billing system when a subscription becomes active.
pub async fn reprocess_suspended_events(
    State(state): State<AppState>,
    Query(query): Query<ReprocessQuery>,
) -> Response {
    let user_id = query.user_id;
    if user_id.is_empty() {
        return response::bad_request("user_id query parameter is required").into_response();
    }

    info!(user = %user_id, "suspended replay requested");
    let suspended = state.suspended.clone();
    tokio::spawn(async move {
        match suspended.replay(&user_id).await {
            Ok(count) => info!(user = %user_id, count, "suspended replay done"),
            Err(e) => error!(user = %user_id, error = %e, "suspended replay failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(ReprocessResponse {
            message: "Processing started",
        }),
    )
        .into_response()
}
