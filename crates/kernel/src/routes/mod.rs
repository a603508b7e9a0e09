//! HTTP routes.

pub mod admin;
pub mod audit;
pub mod auth;
pub mod changes;
pub mod datasets;
pub mod health;
pub mod notifications;
pub mod projects;
pub mod snapshots;

use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{ChangeRequest, Dataset, Project};
use crate::state::AppState;

/// Resolve a project from a path key (UUID or public id).
pub(crate) async fn resolve_project(state: &AppState, key: &str) -> AppResult<Project> {
    Project::resolve(state.db(), key)
        .await?
        .ok_or(AppError::NotFound)
}

/// Resolve a dataset from a path key.
pub(crate) async fn resolve_dataset(state: &AppState, key: &str) -> AppResult<Dataset> {
    Dataset::resolve(state.db(), key)
        .await?
        .ok_or(AppError::NotFound)
}

/// Resolve a change request from a path key, scoped to a project.
pub(crate) async fn resolve_change(
    state: &AppState,
    project_id: Uuid,
    key: &str,
) -> AppResult<ChangeRequest> {
    ChangeRequest::resolve(state.db(), key)
        .await?
        .filter(|cr| cr.project_id == project_id)
        .ok_or(AppError::NotFound)
}
