//! Change request routes: listing, detail, preview, reviewer actions,
//! and discussion.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::{
    ChangeRequest, CrComment, CrEvent, Dataset, ProjectRole, ReviewerState, User,
};
use crate::routes::{resolve_change, resolve_project};
use crate::staging::StagingPreview;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    comment: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    reason: String,
}

#[derive(Debug, Deserialize)]
struct CommentRequest {
    body: String,
}

/// Reviewer state joined with the reviewer's email.
#[derive(Debug, Serialize)]
struct ReviewerDetail {
    #[serde(flatten)]
    state: ReviewerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChangeDetail {
    #[serde(flatten)]
    cr: ChangeRequest,
    reviewers: Vec<ReviewerDetail>,
    events: Vec<CrEvent>,
    comments: Vec<CrComment>,
}

#[derive(Debug, Serialize)]
struct ApproveResponse {
    #[serde(flatten)]
    cr: ChangeRequest,
    message: String,
}

async fn load_dataset(state: &AppState, cr: &ChangeRequest) -> AppResult<Dataset> {
    Dataset::find_by_id(state.db(), cr.dataset_id)
        .await?
        .ok_or(AppError::NotFound)
}

/// GET /api/projects/{id}/changes
async fn list_changes(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<ChangeRequest>>> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Viewer)
        .await?;

    let crs =
        ChangeRequest::list_for_project(state.db(), project.id, query.status.as_deref()).await?;
    Ok(Json(crs))
}

/// GET /api/projects/{id}/changes/{change_id}
async fn get_change(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, change_key)): Path<(String, String)>,
) -> AppResult<Json<ChangeDetail>> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Viewer)
        .await?;
    let cr = resolve_change(&state, project.id, &change_key).await?;

    let reviewer_ids = cr.reviewers();
    let emails = User::emails_for(state.db(), &reviewer_ids).await?;
    let reviewers = cr
        .reviewer_states
        .0
        .iter()
        .map(|s| ReviewerDetail {
            state: s.clone(),
            email: emails
                .iter()
                .find(|(id, _)| *id == s.user_id)
                .map(|(_, email)| email.clone()),
        })
        .collect();

    let events = CrEvent::list_for_cr(state.db(), cr.id).await?;
    let comments = CrComment::list_for_cr(state.db(), cr.id).await?;

    Ok(Json(ChangeDetail {
        cr,
        reviewers,
        events,
        comments,
    }))
}

/// GET /api/projects/{id}/changes/{change_id}/preview
async fn preview_change(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, change_key)): Path<(String, String)>,
    Query(query): Query<PreviewQuery>,
) -> AppResult<Json<StagingPreview>> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Viewer)
        .await?;
    let cr = resolve_change(&state, project.id, &change_key).await?;
    let dataset = load_dataset(&state, &cr).await?;

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0);

    let preview = state.changes().preview(&cr, &dataset, limit, offset).await?;
    Ok(Json(preview))
}

/// POST /api/projects/{id}/changes/{change_id}/approve
///
/// Records this reviewer's approval; the final approval triggers the
/// merge. `force` is honored only for project owners and bypasses only
/// the row-overlap conflict guard.
async fn approve_change(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, change_key)): Path<(String, String)>,
    Json(request): Json<ApproveRequest>,
) -> AppResult<Json<ApproveResponse>> {
    let project = resolve_project(&state, &key).await?;
    let role = state
        .permissions()
        .require(project.id, &user, ProjectRole::Contributor)
        .await?;
    let cr = resolve_change(&state, project.id, &change_key).await?;
    let dataset = load_dataset(&state, &cr).await?;

    if request.force && role != ProjectRole::Owner {
        return Err(AppError::Forbidden);
    }

    let outcome = state
        .changes()
        .approve(cr, &dataset, &user, request.comment, request.force)
        .await?;

    Ok(Json(ApproveResponse {
        cr: outcome.cr,
        message: outcome.message,
    }))
}

/// POST /api/projects/{id}/changes/{change_id}/reject
async fn reject_change(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, change_key)): Path<(String, String)>,
    Json(request): Json<RejectRequest>,
) -> AppResult<Json<ChangeRequest>> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Contributor)
        .await?;
    let cr = resolve_change(&state, project.id, &change_key).await?;
    let dataset = load_dataset(&state, &cr).await?;

    if request.reason.trim().is_empty() {
        return Err(AppError::InvalidPayload("a reason is required".to_string()));
    }

    let cr = state
        .changes()
        .reject(cr, &dataset, &user, request.reason.trim())
        .await?;
    Ok(Json(cr))
}

/// POST /api/projects/{id}/changes/{change_id}/withdraw
async fn withdraw_change(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, change_key)): Path<(String, String)>,
) -> AppResult<Json<ChangeRequest>> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Viewer)
        .await?;
    let cr = resolve_change(&state, project.id, &change_key).await?;
    let dataset = load_dataset(&state, &cr).await?;

    let cr = state.changes().withdraw(cr, &dataset, &user).await?;
    Ok(Json(cr))
}

/// GET /api/projects/{id}/changes/{change_id}/comments
async fn list_comments(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, change_key)): Path<(String, String)>,
) -> AppResult<Json<Vec<CrComment>>> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Viewer)
        .await?;
    let cr = resolve_change(&state, project.id, &change_key).await?;

    let comments = CrComment::list_for_cr(state.db(), cr.id).await?;
    Ok(Json(comments))
}

/// POST /api/projects/{id}/changes/{change_id}/comments
async fn create_comment(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, change_key)): Path<(String, String)>,
    Json(request): Json<CommentRequest>,
) -> AppResult<(StatusCode, Json<CrComment>)> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Viewer)
        .await?;
    let cr = resolve_change(&state, project.id, &change_key).await?;

    if request.body.trim().is_empty() {
        return Err(AppError::InvalidPayload("comment body cannot be empty".to_string()));
    }

    let comment = CrComment::create(state.db(), cr.id, user.id, request.body.trim()).await?;

    // Let the other participants know.
    let mut recipients = cr.reviewers();
    recipients.push(cr.requester_user_id);
    state
        .notifier()
        .notify_many(
            &recipients,
            Some(user.id),
            &format!("New comment on: {}", cr.title),
            serde_json::json!({ "change_request_id": cr.public_id }),
        )
        .await;

    Ok((StatusCode::CREATED, Json(comment)))
}

/// Create the change request router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/projects/{id}/changes", get(list_changes))
        .route("/api/projects/{id}/changes/{change_id}", get(get_change))
        .route(
            "/api/projects/{id}/changes/{change_id}/preview",
            get(preview_change),
        )
        .route(
            "/api/projects/{id}/changes/{change_id}/approve",
            post(approve_change),
        )
        .route(
            "/api/projects/{id}/changes/{change_id}/reject",
            post(reject_change),
        )
        .route(
            "/api/projects/{id}/changes/{change_id}/withdraw",
            post(withdraw_change),
        )
        .route(
            "/api/projects/{id}/changes/{change_id}/comments",
            get(list_comments),
        )
        .route(
            "/api/projects/{id}/changes/{change_id}/comments",
            post(create_comment),
        )
}
