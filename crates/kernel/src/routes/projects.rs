//! Project, membership, and dataset management routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::kinds;
use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::{
    CreateDataset, Dataset, DatasetMeta, NewAuditEvent, Project, ProjectRole, StorageKind, User,
};
use crate::routes::{resolve_dataset, resolve_project};
use crate::staging::storage_error;
use crate::state::AppState;
use crate::storage::TableRef;

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AddMemberRequest {
    email: String,
    role: String,
}

/// POST /api/projects
async fn create_project(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(request): Json<CreateProjectRequest>,
) -> AppResult<(StatusCode, Json<Project>)> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidPayload("project name is required".to_string()));
    }
    if Project::name_taken(state.db(), name).await? {
        return Err(AppError::NameConflict);
    }

    let project = Project::create(state.db(), name, user.id).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/projects
async fn list_projects(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<Json<Vec<Project>>> {
    let projects = Project::list_for_user(state.db(), user.id).await?;
    Ok(Json(projects))
}

/// DELETE /api/projects/{id}
async fn delete_project(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
) -> AppResult<StatusCode> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Owner)
        .await?;

    Project::delete(state.db(), project.id).await?;
    state.permissions().invalidate_project(project.id);

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/projects/{id}/members
async fn list_members(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
) -> AppResult<Json<Vec<crate::models::MemberInfo>>> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Viewer)
        .await?;

    let members = Project::members(state.db(), project.id).await?;
    Ok(Json(members))
}

/// POST /api/projects/{id}/members
async fn add_member(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
    Json(request): Json<AddMemberRequest>,
) -> AppResult<Json<Vec<crate::models::MemberInfo>>> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Owner)
        .await?;

    let role = ProjectRole::parse(&request.role)
        .ok_or_else(|| AppError::InvalidPayload("unknown role".to_string()))?;
    if role == ProjectRole::Owner {
        return Err(AppError::InvalidPayload(
            "a project has exactly one owner".to_string(),
        ));
    }

    let target = User::find_by_email(state.db(), request.email.trim())
        .await?
        .ok_or(AppError::NotFound)?;

    // The owner keeps the owner role; assigning them anything else would
    // leave the project ownerless.
    if target.id == project.owner_user_id {
        return Err(AppError::CannotDemoteOwner);
    }

    Project::upsert_member(state.db(), project.id, target.id, role).await?;
    state.permissions().invalidate(project.id, target.id);

    let members = Project::members(state.db(), project.id).await?;
    Ok(Json(members))
}

/// DELETE /api/projects/{id}/members/{userId}
async fn remove_member(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, member_id)): Path<(String, Uuid)>,
) -> AppResult<StatusCode> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Owner)
        .await?;

    if member_id == user.id {
        return Err(AppError::CannotRemoveSelf);
    }
    if member_id == project.owner_user_id {
        return Err(AppError::CannotRemoveOwner);
    }

    let removed = Project::remove_member(state.db(), project.id, member_id).await?;
    if !removed {
        return Err(AppError::NotFound);
    }
    state.permissions().invalidate(project.id, member_id);

    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/projects/{id}/datasets
async fn create_dataset(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
    Json(input): Json<CreateDataset>,
) -> AppResult<(StatusCode, Json<Dataset>)> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Contributor)
        .await?;

    let name = input.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::InvalidPayload("dataset name is required".to_string()));
    }
    if Dataset::name_taken(state.db(), project.id, &name).await? {
        return Err(AppError::NameConflict);
    }

    let backend = input.storage_backend.unwrap_or(match state.config().default_storage_backend {
        crate::config::DefaultBackend::Versioned => StorageKind::Versioned,
        crate::config::DefaultBackend::Relational => StorageKind::Relational,
    });

    let columns = input
        .schema
        .as_ref()
        .map(|s| s.column_names())
        .unwrap_or_default();

    let input = CreateDataset { name, ..input };
    let dataset = Dataset::create(state.db(), project.id, input, backend).await?;

    let table = TableRef::main(project.id, dataset.id);
    if let Err(e) = state
        .storage()
        .for_kind(backend)
        .ensure(&table, &columns)
        .await
    {
        Dataset::delete(state.db(), dataset.id).await.ok();
        return Err(storage_error(e));
    }

    state
        .audit()
        .record(NewAuditEvent {
            project_id: project.id,
            dataset_id: dataset.id,
            kind: kinds::DATASET_CREATED.to_string(),
            title: dataset.name.clone(),
            description: format!("Dataset created on the {} backend", backend.as_str()),
            actor_user_id: Some(user.id),
            change_request_id: None,
            snapshot_version: None,
            rows_added: 0,
            rows_updated: 0,
            rows_deleted: 0,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(dataset)))
}

/// GET /api/projects/{id}/datasets
async fn list_datasets(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
) -> AppResult<Json<Vec<Dataset>>> {
    let project = resolve_project(&state, &key).await?;
    state
        .permissions()
        .require(project.id, &user, ProjectRole::Viewer)
        .await?;

    let datasets = Dataset::list_for_project(state.db(), project.id).await?;
    Ok(Json(datasets))
}

/// DELETE /api/datasets/{id}
///
/// Owners may always delete; contributors only while the dataset is
/// empty.
async fn delete_dataset(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
) -> AppResult<StatusCode> {
    let dataset = resolve_dataset(&state, &key).await?;
    let role = state
        .permissions()
        .require(dataset.project_id, &user, ProjectRole::Contributor)
        .await?;

    if role != ProjectRole::Owner {
        let meta = DatasetMeta::find(state.db(), dataset.id).await?;
        let row_count = meta.map(|m| m.row_count).unwrap_or(0);
        if row_count > 0 {
            return Err(AppError::Forbidden);
        }
    }

    Dataset::delete(state.db(), dataset.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create the project router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/projects", post(create_project))
        .route("/api/projects", get(list_projects))
        .route("/api/projects/{id}", delete(delete_project))
        .route("/api/projects/{id}/members", get(list_members))
        .route("/api/projects/{id}/members", post(add_member))
        .route("/api/projects/{id}/members/{user_id}", delete(remove_member))
        .route("/api/projects/{id}/datasets", post(create_dataset))
        .route("/api/projects/{id}/datasets", get(list_datasets))
        .route("/api/datasets/{id}", delete(delete_dataset))
}
