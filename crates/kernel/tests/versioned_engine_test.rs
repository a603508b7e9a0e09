//! Integration tests for the file-backed versioned table engine.
//!
//! Exercises the full storage contract against a temporary directory:
//! append, time-travel reads, staged merges, retry convergence, restore,
//! and operation history.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use uuid::Uuid;

use quorum_kernel::storage::{
    MergeOptions, Row, StagedRow, StorageBackend, StorageError, TableRef, VersionedBackend,
};

fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

fn pk() -> Vec<String> {
    vec!["id".to_string()]
}

fn backend() -> (tempfile::TempDir, VersionedBackend) {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = VersionedBackend::new(dir.path());
    (dir, backend)
}

fn table() -> TableRef {
    TableRef::main(Uuid::now_v7(), Uuid::now_v7())
}

#[tokio::test]
async fn append_advances_versions() {
    let (_dir, backend) = backend();
    let t = table();

    backend.ensure(&t, &["id".to_string(), "name".to_string()]).await.unwrap();

    let v1 = backend
        .append(&t, &[row(&[("id", json!(1)), ("name", json!("a"))])], &pk())
        .await
        .unwrap();
    assert_eq!(v1, 1);

    let v2 = backend
        .append(&t, &[row(&[("id", json!(2)), ("name", json!("b"))])], &pk())
        .await
        .unwrap();
    assert_eq!(v2, 2);

    let stats = backend.stats(&t).await.unwrap();
    assert_eq!(stats.row_count, 2);
    assert_eq!(stats.current_version, 2);
}

#[tokio::test]
async fn time_travel_reads_see_old_versions() {
    let (_dir, backend) = backend();
    let t = table();

    backend
        .append(&t, &[row(&[("id", json!(1)), ("name", json!("a"))])], &pk())
        .await
        .unwrap();
    backend
        .append(&t, &[row(&[("id", json!(2)), ("name", json!("b"))])], &pk())
        .await
        .unwrap();

    let at_v1 = backend.read(&t, Some(1), 100, 0).await.unwrap();
    assert_eq!(at_v1.total, 1);
    assert_eq!(at_v1.rows[0].get("name"), Some(&json!("a")));

    let latest = backend.read(&t, None, 100, 0).await.unwrap();
    assert_eq!(latest.total, 2);

    let empty = backend.read(&t, Some(0), 100, 0).await.unwrap();
    assert_eq!(empty.total, 0);

    assert!(matches!(
        backend.read(&t, Some(99), 100, 0).await,
        Err(StorageError::VersionNotFound(99))
    ));
}

#[tokio::test]
async fn read_pages_with_limit_and_offset() {
    let (_dir, backend) = backend();
    let t = table();

    let rows: Vec<Row> = (0..10)
        .map(|i| row(&[("id", json!(i)), ("name", json!(format!("r{i}")))]))
        .collect();
    backend.append(&t, &rows, &pk()).await.unwrap();

    let page = backend.read(&t, None, 3, 4).await.unwrap();
    assert_eq!(page.total, 10);
    assert_eq!(page.rows.len(), 3);
    assert_eq!(page.rows[0].get("id"), Some(&json!(4)));
}

#[tokio::test]
async fn merge_upserts_by_primary_key() {
    let (_dir, backend) = backend();
    let t = table();
    let staging = TableRef::staging(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

    backend
        .append(
            &t,
            &[
                row(&[("id", json!(1)), ("name", json!("a"))]),
                row(&[("id", json!(2)), ("name", json!("b"))]),
            ],
            &pk(),
        )
        .await
        .unwrap();

    backend
        .write_staging(
            &staging,
            &[
                StagedRow {
                    key: "2".to_string(),
                    data: row(&[("id", json!(2)), ("name", json!("updated"))]),
                    deleted: false,
                },
                StagedRow {
                    key: "3".to_string(),
                    data: row(&[("id", json!(3)), ("name", json!("new"))]),
                    deleted: false,
                },
            ],
        )
        .await
        .unwrap();

    let outcome = backend
        .merge(&t, &staging, &pk(), MergeOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.version_before, 1);
    assert_eq!(outcome.version_after, 2);
    assert_eq!(outcome.rows_added, 1);
    assert_eq!(outcome.rows_updated, 1);

    let latest = backend.read(&t, None, 100, 0).await.unwrap();
    assert_eq!(latest.total, 3);
    let updated = latest
        .rows
        .iter()
        .find(|r| r.get("id") == Some(&json!(2)))
        .unwrap();
    assert_eq!(updated.get("name"), Some(&json!("updated")));
}

#[tokio::test]
async fn merge_retry_converges_to_the_same_version() {
    let (_dir, backend) = backend();
    let t = table();
    let staging = TableRef::staging(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

    backend
        .write_staging(
            &staging,
            &[StagedRow {
                key: "1".to_string(),
                data: row(&[("id", json!(1)), ("name", json!("a"))]),
                deleted: false,
            }],
        )
        .await
        .unwrap();

    let first = backend
        .merge(&t, &staging, &pk(), MergeOptions::default())
        .await
        .unwrap();
    let retry = backend
        .merge(&t, &staging, &pk(), MergeOptions::default())
        .await
        .unwrap();

    assert_eq!(first.version_after, retry.version_after);
    assert_eq!(first.rows_added, retry.rows_added);

    let latest = backend.read(&t, None, 100, 0).await.unwrap();
    assert_eq!(latest.total, 1, "retried merge must not duplicate rows");
}

#[tokio::test]
async fn merge_applies_deletes_only_when_enabled() {
    let (_dir, backend) = backend();
    let t = table();
    let staging = TableRef::staging(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

    backend
        .append(&t, &[row(&[("id", json!(1)), ("name", json!("a"))])], &pk())
        .await
        .unwrap();

    backend
        .write_staging(
            &staging,
            &[StagedRow {
                key: "1".to_string(),
                data: Row::new(),
                deleted: true,
            }],
        )
        .await
        .unwrap();

    let outcome = backend
        .merge(&t, &staging, &pk(), MergeOptions { apply_deletes: true })
        .await
        .unwrap();
    assert_eq!(outcome.rows_deleted, 1);

    let latest = backend.read(&t, None, 100, 0).await.unwrap();
    assert_eq!(latest.total, 0);
}

#[tokio::test]
async fn restore_produces_a_new_version_with_old_contents() {
    let (_dir, backend) = backend();
    let t = table();

    backend
        .append(&t, &[row(&[("id", json!(1)), ("name", json!("a"))])], &pk())
        .await
        .unwrap();
    backend
        .append(&t, &[row(&[("id", json!(2)), ("name", json!("b"))])], &pk())
        .await
        .unwrap();

    let op = backend.restore(&t, 1).await.unwrap();
    assert_eq!(op.version, 3, "restore appends a version");
    assert_eq!(op.restored_from, Some(1));

    let restored = backend.read(&t, Some(3), 100, 0).await.unwrap();
    let original = backend.read(&t, Some(1), 100, 0).await.unwrap();
    assert_eq!(restored.rows, original.rows);

    // History is intact: version 2 still readable.
    let middle = backend.read(&t, Some(2), 100, 0).await.unwrap();
    assert_eq!(middle.total, 2);

    assert!(matches!(
        backend.restore(&t, 42).await,
        Err(StorageError::VersionNotFound(42))
    ));
}

#[tokio::test]
async fn history_records_every_operation_in_order() {
    let (_dir, backend) = backend();
    let t = table();
    let staging = TableRef::staging(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

    backend
        .append(&t, &[row(&[("id", json!(1))])], &pk())
        .await
        .unwrap();
    backend
        .write_staging(
            &staging,
            &[StagedRow {
                key: "2".to_string(),
                data: row(&[("id", json!(2))]),
                deleted: false,
            }],
        )
        .await
        .unwrap();
    backend
        .merge(&t, &staging, &pk(), MergeOptions::default())
        .await
        .unwrap();
    backend.restore(&t, 1).await.unwrap();

    let history = backend.history(&t).await.unwrap();
    let ops: Vec<(&str, i64)> = history.iter().map(|o| (o.op.as_str(), o.version)).collect();
    assert_eq!(ops, vec![("WRITE", 1), ("MERGE", 2), ("RESTORE", 3)]);
}

#[tokio::test]
async fn staging_destroy_is_idempotent_and_isolated() {
    let (_dir, backend) = backend();
    let staging = TableRef::staging(Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

    backend
        .write_staging(
            &staging,
            &[StagedRow {
                key: "1".to_string(),
                data: row(&[("id", json!(1))]),
                deleted: false,
            }],
        )
        .await
        .unwrap();

    let (page, total) = backend.read_staging(&staging, 10, 0).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(page.len(), 1);

    backend.destroy_staging(&staging).await.unwrap();
    backend.destroy_staging(&staging).await.unwrap();

    assert!(matches!(
        backend.read_staging(&staging, 10, 0).await,
        Err(StorageError::TableNotFound)
    ));
}

#[tokio::test]
async fn missing_table_reads_fail_cleanly() {
    let (_dir, backend) = backend();
    let t = table();

    assert!(matches!(
        backend.read(&t, None, 10, 0).await,
        Err(StorageError::TableNotFound)
    ));
    assert!(matches!(
        backend.stats(&t).await,
        Err(StorageError::TableNotFound)
    ));
    assert!(matches!(
        backend.history(&t).await,
        Err(StorageError::TableNotFound)
    ));
}
