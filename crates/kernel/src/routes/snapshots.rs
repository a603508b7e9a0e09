//! Snapshot routes: calendar, time-travel reads, and restore.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::audit::kinds;
use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::models::{Dataset, DatasetMeta, NewAuditEvent, ProjectRole};
use crate::routes::resolve_dataset;
use crate::staging::storage_error;
use crate::state::AppState;
use crate::storage::{RowSet, TableRef};

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RestoreResponse {
    dataset_id: String,
    restored_from: i64,
    version: i64,
}

async fn dataset_for(
    state: &AppState,
    user: &crate::models::User,
    key: &str,
    min: ProjectRole,
) -> AppResult<Dataset> {
    let dataset = resolve_dataset(state, key).await?;
    state
        .permissions()
        .require(dataset.project_id, user, min)
        .await?;
    Ok(dataset)
}

/// GET /api/datasets/{id}/snapshots/calendar
async fn snapshot_calendar(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
) -> AppResult<Json<Vec<crate::audit::CalendarDay>>> {
    let dataset = dataset_for(&state, &user, &key, ProjectRole::Viewer).await?;

    let main = TableRef::main(dataset.project_id, dataset.id);
    let ops = state
        .storage()
        .for_dataset(&dataset)
        .history(&main)
        .await
        .map_err(storage_error)
        .unwrap_or_default();

    let calendar = state.audit().calendar(dataset.id, ops).await?;
    Ok(Json(calendar))
}

/// GET /api/datasets/{id}/snapshots/{version}/data
///
/// Time-travel read at a specific version.
async fn snapshot_data(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, version)): Path<(String, i64)>,
    Query(query): Query<PageQuery>,
) -> AppResult<Json<RowSet>> {
    let dataset = dataset_for(&state, &user, &key, ProjectRole::Viewer).await?;

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0);

    let main = TableRef::main(dataset.project_id, dataset.id);
    let rows = state
        .storage()
        .for_dataset(&dataset)
        .read(&main, Some(version), limit, offset)
        .await
        .map_err(storage_error)?;

    Ok(Json(rows))
}

/// POST /api/datasets/{id}/snapshots/{version}/restore
///
/// Produce a new version whose contents equal `version`. History is
/// never rewritten.
async fn restore_snapshot(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path((key, version)): Path<(String, i64)>,
) -> AppResult<Json<RestoreResponse>> {
    let dataset = dataset_for(&state, &user, &key, ProjectRole::Contributor).await?;

    let backend = state.storage().for_dataset(&dataset);
    let main = TableRef::main(dataset.project_id, dataset.id);

    let op = backend
        .restore(&main, version)
        .await
        .map_err(storage_error)?;

    let stats = backend.stats(&main).await.map_err(storage_error)?;
    DatasetMeta::record_update(
        state.db(),
        dataset.id,
        op.version,
        stats.row_count,
        stats.column_count as i32,
    )
    .await?;

    state
        .audit()
        .record(NewAuditEvent {
            project_id: dataset.project_id,
            dataset_id: dataset.id,
            kind: kinds::RESTORE.to_string(),
            title: format!("Restored to version {version}"),
            description: format!(
                "Version {} now mirrors the contents of version {version}",
                op.version
            ),
            actor_user_id: Some(user.id),
            change_request_id: None,
            snapshot_version: Some(op.version),
            rows_added: 0,
            rows_updated: 0,
            rows_deleted: 0,
        })
        .await?;

    Ok(Json(RestoreResponse {
        dataset_id: dataset.public_id,
        restored_from: version,
        version: op.version,
    }))
}

/// Create the snapshot router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/datasets/{id}/snapshots/calendar", get(snapshot_calendar))
        .route(
            "/api/datasets/{id}/snapshots/{version}/data",
            get(snapshot_data),
        )
        .route(
            "/api/datasets/{id}/snapshots/{version}/restore",
            post(restore_snapshot),
        )
}
