//! API route definitions.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tracing::error;

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/live", get(live))
        .route("/health", get(health))
}

async fn live() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Unhealthy when the newest recorded run of any job did not succeed.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let history = Arc::clone(&state.history);
    let listed = match tokio::task::spawn_blocking(move || history.list()).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    let stats = match listed {
        Ok(stats) => stats,
        Err(e) => {
            error!(error = %e, "health check could not read history");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "error": e })),
            );
        }
    };

    let failing: Vec<&str> = stats
        .iter()
        .filter(|(_, runs)| runs.first().is_some_and(|s| !s.success))
        .map(|(name, _)| name.as_str())
        .collect();

    if failing.is_empty() {
        (StatusCode::OK, Json(json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "failing", "failing": failing })),
        )
    }
}
