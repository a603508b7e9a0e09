//! Health check endpoint.

use axum::{Json, Router, extract::State, routing::get};
use serde_json::json;

use crate::state::AppState;

/// GET /api/health
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let catalog = if state.catalog_healthy().await {
        "up"
    } else {
        "down"
    };

    Json(json!({
        "status": "ok",
        "catalog": catalog,
    }))
}

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/health", get(health))
}
