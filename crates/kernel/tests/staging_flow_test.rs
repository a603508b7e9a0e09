//! Integration tests for the staging pipeline over the versioned backend.
//!
//! Drives the same path a change request takes — parse an upload, stage
//! it, preview, diff against the pre-image, merge — without the HTTP or
//! catalog layers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use quorum_kernel::changes::diff::{compute_diff, projected_image};
use quorum_kernel::ingest::{UploadFormat, parse_upload};
use quorum_kernel::models::{Dataset, EditSet, EditedCell};
use quorum_kernel::staging::{StagingManager, StorageRouter};
use quorum_kernel::storage::{
    ColumnDef, ColumnType, MergeOptions, RelationalBackend, StorageBackend, TableRef,
    TableSchema, VersionedBackend,
};
use quorum_kernel::validation::{ValidationState, Validator};

fn schema() -> TableSchema {
    TableSchema {
        columns: vec![
            ColumnDef {
                name: "id".to_string(),
                data_type: ColumnType::Integer,
                required: true,
            },
            ColumnDef {
                name: "name".to_string(),
                data_type: ColumnType::String,
                required: false,
            },
        ],
        primary_key: None,
    }
}

fn dataset(root_project: Uuid) -> Dataset {
    Dataset {
        id: Uuid::now_v7(),
        public_id: "ds0000000001".to_string(),
        project_id: root_project,
        name: "readings".to_string(),
        storage_backend: "versioned".to_string(),
        table_schema: Some(sqlx::types::Json(schema())),
        rules: None,
        created_at: Utc::now(),
    }
}

/// A manager whose relational half is never touched: the pool is lazy and
/// no test routes a dataset to it.
fn manager(dir: &tempfile::TempDir) -> StagingManager {
    let versioned = Arc::new(VersionedBackend::new(dir.path()));
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://localhost/unused")
        .expect("lazy pool");
    let relational = Arc::new(RelationalBackend::new(pool));
    StagingManager::new(StorageRouter::new(versioned, relational))
}

#[tokio::test]
async fn staged_append_merges_like_the_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let staging = manager(&dir);
    let ds = dataset(Uuid::now_v7());
    let cr_id = Uuid::now_v7();

    // Parse the upload the way the validate endpoint does.
    let rows = parse_upload(
        b"id,name\n1,a\n2,b\n",
        UploadFormat::Csv,
        Some(&schema()),
    )
    .unwrap();

    let validator = Validator::new(Some(schema()), None);
    assert_eq!(validator.validate_rows(&rows).state, ValidationState::Pass);

    staging.stage_append(&ds, cr_id, &rows).await.unwrap();

    let preview = staging.preview(&ds, cr_id, 10, 0).await.unwrap();
    assert_eq!(preview.total, 2);
    assert_eq!(preview.rows[0].get("id"), Some(&json!(1)));
    assert!(preview.deleted_rows.is_empty());

    let staged = staging.staged_rows(&ds, cr_id).await.unwrap();
    let diff = compute_diff(&[], &staged, &ds.primary_keys(), false);
    assert_eq!(diff.rows_added, 2);
    assert_eq!(diff.rows_updated, 0);

    let backend = staging.router().for_dataset(&ds);
    let main = TableRef::main(ds.project_id, ds.id);
    let outcome = backend
        .merge(
            &main,
            &StagingManager::staging_ref(&ds, cr_id),
            &ds.primary_keys(),
            MergeOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.version_after, 1);
    assert_eq!(outcome.rows_added, 2);

    let table = backend.read(&main, None, 10, 0).await.unwrap();
    assert_eq!(table.total, 2);

    staging.destroy(&ds, cr_id).await.unwrap();
    assert!(staging.preview(&ds, cr_id, 10, 0).await.is_err());
}

#[tokio::test]
async fn staged_edits_carry_full_projected_rows_and_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let staging = manager(&dir);
    let ds = dataset(Uuid::now_v7());

    // Seed the main table.
    let backend = staging.router().for_dataset(&ds);
    let main = TableRef::main(ds.project_id, ds.id);
    let seed = parse_upload(
        b"id,name\n1,a\n2,b\n3,c\n",
        UploadFormat::Csv,
        Some(&schema()),
    )
    .unwrap();
    backend.append(&main, &seed, &ds.primary_keys()).await.unwrap();

    let cr_id = Uuid::now_v7();
    let edits = EditSet {
        session_id: Some("sess-1".to_string()),
        cells: vec![EditedCell {
            row_key: "2".to_string(),
            column: "name".to_string(),
            value: json!("edited"),
        }],
        deleted_rows: vec!["3".to_string()],
    };

    staging.stage_edits(&ds, cr_id, &edits).await.unwrap();

    let staged = staging.staged_rows(&ds, cr_id).await.unwrap();
    let upsert = staged.iter().find(|s| !s.deleted).unwrap();
    assert_eq!(upsert.data.get("id"), Some(&json!(2)), "full row staged");
    assert_eq!(upsert.data.get("name"), Some(&json!("edited")));
    assert!(staged.iter().any(|s| s.deleted && s.key == "3"));

    // Live edits apply deletes at merge time.
    let pre = backend.read(&main, None, 100, 0).await.unwrap();
    let image = projected_image(&pre.rows, &staged, &ds.primary_keys(), true);
    assert_eq!(image.len(), 2);

    let diff = compute_diff(&pre.rows, &staged, &ds.primary_keys(), true);
    assert_eq!(diff.rows_updated, 1);
    assert_eq!(diff.rows_deleted, 1);
    assert_eq!(diff.cells_changed, 1 + 2);
}

#[tokio::test]
async fn editing_a_missing_row_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let staging = manager(&dir);
    let ds = dataset(Uuid::now_v7());

    let backend = staging.router().for_dataset(&ds);
    let main = TableRef::main(ds.project_id, ds.id);
    backend.ensure(&main, &["id".to_string()]).await.unwrap();

    let edits = EditSet {
        session_id: None,
        cells: vec![EditedCell {
            row_key: "404".to_string(),
            column: "name".to_string(),
            value: json!("x"),
        }],
        deleted_rows: Vec::new(),
    };

    let err = staging
        .stage_edits(&ds, Uuid::now_v7(), &edits)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_payload");
}
