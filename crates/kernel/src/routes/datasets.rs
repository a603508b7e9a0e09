//! Dataset ingestion routes: upload validation, change request opening,
//! live-edit submission, and the audit timeline.

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::changes::{OpenAppend, OpenLiveEdit};
use crate::error::{AppError, AppResult};
use crate::ingest;
use crate::middleware::CurrentUser;
use crate::models::{
    ChangeRequest, Dataset, EditSet, EditedCell, MAX_UPLOAD_BYTES, ProjectRole, Upload,
};
use crate::routes::{resolve_dataset, resolve_project};
use crate::staging::storage_error;
use crate::state::AppState;
use crate::storage::TableRef;
use crate::validation::{ValidationSummary, Validator, validate_rows_with_deadline};

#[derive(Debug, Serialize)]
struct ValidateUploadResponse {
    ok: bool,
    upload_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rules: Option<serde_json::Value>,
    validation: ValidationSummary,
}

#[derive(Debug, Deserialize)]
struct JsonValidateRequest {
    rows: Vec<crate::storage::Row>,
    filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAppendRequest {
    upload_id: Uuid,
    reviewer_ids: Vec<Uuid>,
    title: Option<String>,
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LiveEditSubmitRequest {
    session_id: Option<String>,
    title: String,
    reviewer_ids: Vec<Uuid>,
    #[serde(default)]
    edited_cells: Vec<EditedCell>,
    #[serde(default)]
    deleted_rows: Vec<String>,
    comment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidateCellRequest {
    row_key: String,
    column: String,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

fn validator_for(dataset: &Dataset) -> Validator {
    Validator::new(
        dataset.table_schema.as_ref().map(|s| s.0.clone()),
        dataset.rules.as_ref().map(|r| r.0.clone()),
    )
}

/// POST /api/datasets/{id}/append/validate
///
/// Multipart upload. Parses and validates the file, stores it, and
/// returns the upload id for a later `append/open`.
async fn validate_append(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
    mut multipart: Multipart,
) -> AppResult<Json<ValidateUploadResponse>> {
    let dataset = resolve_dataset(&state, &key).await?;
    state
        .permissions()
        .require(dataset.project_id, &user, ProjectRole::Contributor)
        .await?;

    let mut filename: Option<String> = None;
    let mut data: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidPayload(format!("bad multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::InvalidFile(format!("failed to read upload: {e}")))?;
            data = Some(bytes.to_vec());
        }
    }

    let filename = filename.unwrap_or_else(|| "upload.csv".to_string());
    let data = data.ok_or_else(|| AppError::InvalidPayload("missing 'file' field".to_string()))?;

    store_validated_upload(&state, &dataset, &user.id, &filename, &data).await
}

/// POST /api/datasets/{id}/append/json/validate
///
/// JSON-rows variant of upload validation.
async fn validate_append_json(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
    Json(request): Json<JsonValidateRequest>,
) -> AppResult<Json<ValidateUploadResponse>> {
    let dataset = resolve_dataset(&state, &key).await?;
    state
        .permissions()
        .require(dataset.project_id, &user, ProjectRole::Contributor)
        .await?;

    let filename = request
        .filename
        .unwrap_or_else(|| "rows.json".to_string());
    let data = serde_json::to_vec(&request.rows)
        .map_err(|e| AppError::InvalidPayload(format!("unserializable rows: {e}")))?;

    store_validated_upload(&state, &dataset, &user.id, &filename, &data).await
}

async fn store_validated_upload(
    state: &AppState,
    dataset: &Dataset,
    actor: &Uuid,
    filename: &str,
    data: &[u8],
) -> AppResult<Json<ValidateUploadResponse>> {
    if data.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::FileTooLarge);
    }
    if data.is_empty() {
        return Err(AppError::InvalidFile("upload is empty".to_string()));
    }

    let format = ingest::format_for_filename(filename)?;
    let schema = dataset.table_schema.as_ref().map(|s| &s.0);
    let rows = ingest::parse_upload(data, format, schema)?;

    let validator = validator_for(dataset);
    let validation =
        validate_rows_with_deadline(&validator, &rows, crate::validation::VALIDATION_DEADLINE)
            .await;

    // Fatal or error findings block here, before anything is retained.
    if validation.blocks_submit() {
        return Err(AppError::ValidationBlocked(validation));
    }

    let upload = Upload::create(
        state.db(),
        dataset.project_id,
        dataset.id,
        filename,
        data,
    )
    .await?;

    tracing::info!(
        upload_id = %upload.id,
        dataset_id = %dataset.id,
        actor = %actor,
        rows = rows.len(),
        "upload validated and stored"
    );

    Ok(Json(ValidateUploadResponse {
        ok: true,
        upload_id: upload.id,
        schema: dataset
            .table_schema
            .as_ref()
            .and_then(|s| serde_json::to_value(&s.0).ok()),
        rules: dataset
            .rules
            .as_ref()
            .and_then(|r| serde_json::to_value(&r.0).ok()),
        validation,
    }))
}

/// POST /api/datasets/{id}/append/open
async fn open_append(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
    Json(request): Json<OpenAppendRequest>,
) -> AppResult<(StatusCode, Json<ChangeRequest>)> {
    let dataset = resolve_dataset(&state, &key).await?;
    state
        .permissions()
        .require(dataset.project_id, &user, ProjectRole::Contributor)
        .await?;
    let project = resolve_project(&state, &dataset.project_id.to_string()).await?;

    let title = request
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("Append to {}", dataset.name));

    let cr = state
        .changes()
        .open_append(
            &project,
            &dataset,
            &user,
            OpenAppend {
                upload_id: request.upload_id,
                reviewer_ids: request.reviewer_ids,
                title,
                comment: request.comment,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(cr)))
}

/// POST /api/datasets/{id}/live-edit/submit
async fn submit_live_edit(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
    Json(request): Json<LiveEditSubmitRequest>,
) -> AppResult<(StatusCode, Json<ChangeRequest>)> {
    let dataset = resolve_dataset(&state, &key).await?;
    state
        .permissions()
        .require(dataset.project_id, &user, ProjectRole::Contributor)
        .await?;
    let project = resolve_project(&state, &dataset.project_id.to_string()).await?;

    if request.title.trim().is_empty() {
        return Err(AppError::InvalidPayload("title is required".to_string()));
    }

    let cr = state
        .changes()
        .open_live_edit(
            &project,
            &dataset,
            &user,
            OpenLiveEdit {
                session_id: request.session_id,
                reviewer_ids: request.reviewer_ids,
                title: request.title,
                edits: EditSet {
                    session_id: None,
                    cells: request.edited_cells,
                    deleted_rows: request.deleted_rows,
                },
                comment: request.comment,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(cr)))
}

/// POST /api/datasets/{id}/live-edit/validate-cell
///
/// Single-cell validation for interactive editing.
async fn validate_cell(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
    Json(request): Json<ValidateCellRequest>,
) -> AppResult<Json<ValidationSummary>> {
    let dataset = resolve_dataset(&state, &key).await?;
    state
        .permissions()
        .require(dataset.project_id, &user, ProjectRole::Contributor)
        .await?;

    let validator = validator_for(&dataset);
    let summary = validator.validate_cell(&request.row_key, &request.column, &request.value);
    Ok(Json(summary))
}

/// GET /api/datasets/{id}/audit
///
/// Merged timeline of catalog audit events and engine history.
async fn dataset_audit(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(key): Path<String>,
    Query(query): Query<TimelineQuery>,
) -> AppResult<Json<Vec<crate::audit::TimelineEntry>>> {
    let dataset = resolve_dataset(&state, &key).await?;
    state
        .permissions()
        .require(dataset.project_id, &user, ProjectRole::Viewer)
        .await?;

    let main = TableRef::main(dataset.project_id, dataset.id);
    let ops = state
        .storage()
        .for_dataset(&dataset)
        .history(&main)
        .await
        .map_err(storage_error)
        .unwrap_or_default();

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let timeline = state
        .audit()
        .timeline(dataset.id, ops, query.kind.as_deref(), limit, offset)
        .await?;

    Ok(Json(timeline))
}

/// Create the dataset ingestion router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/datasets/{id}/append/validate", post(validate_append))
        .route(
            "/api/datasets/{id}/append/json/validate",
            post(validate_append_json),
        )
        .route("/api/datasets/{id}/append/open", post(open_append))
        .route("/api/datasets/{id}/live-edit/submit", post(submit_live_edit))
        .route(
            "/api/datasets/{id}/live-edit/validate-cell",
            post(validate_cell),
        )
        .route("/api/datasets/{id}/audit", get(dataset_audit))
        // Uploads up to the 100 MiB cap, plus multipart framing overhead.
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024))
}
