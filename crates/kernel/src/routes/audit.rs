//! Audit event detail and artifact routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use uuid::Uuid;

use crate::audit::ArtifactKind;
use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::{AuditEvent, ProjectRole};
use crate::state::AppState;

async fn load_event(
    state: &AppState,
    user: &crate::models::User,
    audit_id: Uuid,
) -> AppResult<AuditEvent> {
    let event = AuditEvent::find_by_id(state.db(), audit_id)
        .await?
        .ok_or(AppError::NotFound)?;

    state
        .permissions()
        .require(event.project_id, user, ProjectRole::Viewer)
        .await?;

    Ok(event)
}

/// GET /api/audit/{audit_id}
async fn get_audit(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(audit_id): Path<Uuid>,
) -> AppResult<Json<AuditEvent>> {
    let event = load_event(&state, &user, audit_id).await?;
    Ok(Json(event))
}

async fn get_artifact(
    state: &AppState,
    user: &crate::models::User,
    audit_id: Uuid,
    kind: ArtifactKind,
) -> AppResult<Json<serde_json::Value>> {
    let event = load_event(state, user, audit_id).await?;
    let cr_id = event.change_request_id.ok_or(AppError::NotFound)?;

    let artifact = state
        .audit()
        .read_artifact(cr_id, kind)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(artifact))
}

/// GET /api/audit/{audit_id}/diff
async fn get_diff(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(audit_id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    get_artifact(&state, &user, audit_id, ArtifactKind::Diff).await
}

/// GET /api/audit/{audit_id}/validation
async fn get_validation(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(audit_id): Path<Uuid>,
) -> AppResult<Json<serde_json::Value>> {
    get_artifact(&state, &user, audit_id, ArtifactKind::Validation).await
}

/// Create the audit router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/audit/{audit_id}", get(get_audit))
        .route("/api/audit/{audit_id}/diff", get(get_diff))
        .route("/api/audit/{audit_id}/validation", get(get_validation))
}
