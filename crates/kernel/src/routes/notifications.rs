//! Notification routes for the signed-in user.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::Notification;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    unread_only: bool,
    limit: Option<i64>,
}

/// GET /api/me/notifications
async fn list_notifications(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Notification>>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let notifications =
        Notification::list_for_user(state.db(), user.id, query.unread_only, limit).await?;
    Ok(Json(notifications))
}

/// GET /api/me/notifications/unread-count
async fn unread_count(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<serde_json::Value>> {
    let count = Notification::unread_count(state.db(), user.id).await?;
    Ok(Json(json!({ "unread": count })))
}

/// POST /api/me/notifications/{id}/read
async fn mark_read(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let marked = Notification::mark_read(state.db(), id, user.id).await?;
    if !marked {
        return Err(AppError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Create the notification router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/me/notifications", get(list_notifications))
        .route("/api/me/notifications/unread-count", get(unread_count))
        .route("/api/me/notifications/{id}/read", post(mark_read))
}
