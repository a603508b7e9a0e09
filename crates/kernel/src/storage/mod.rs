//! Dataset table storage.
//!
//! Two backends live behind one [`StorageBackend`] contract: a file-backed
//! versioned engine with time travel and restore, and a relational store
//! without version history. Which one a dataset uses is recorded on the
//! dataset row.
//!
//! Table addressing is derived purely from identifiers — there is no
//! registry of tables. The main table, per-CR staging areas, and live-edit
//! scratch areas all hang off the dataset location:
//!
//! ```text
//! projects/<project_id>/datasets/<dataset_id>/main
//! projects/<project_id>/datasets/<dataset_id>/staging/<cr_id>
//! projects/<project_id>/datasets/<dataset_id>/live_edit/<session>
//! ```

mod relational;
mod versioned;

pub use relational::RelationalBackend;
pub use versioned::VersionedBackend;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A single table row: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Declared dataset shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
}

impl TableSchema {
    /// Primary key columns, defaulting to `id`.
    pub fn primary_keys(&self) -> Vec<String> {
        match &self.primary_key {
            Some(keys) if !keys.is_empty() => keys.clone(),
            _ => vec!["id".to_string()],
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// One declared column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: ColumnType,
    #[serde(default)]
    pub required: bool,
}

/// Supported column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Boolean,
}

/// Location of one table, relative to the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub key: String,
}

impl TableRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Canonical main table for a dataset.
    pub fn main(project_id: Uuid, dataset_id: Uuid) -> Self {
        Self::new(format!("projects/{project_id}/datasets/{dataset_id}/main"))
    }

    /// Per-CR staging area.
    pub fn staging(project_id: Uuid, dataset_id: Uuid, cr_id: Uuid) -> Self {
        Self::new(format!(
            "projects/{project_id}/datasets/{dataset_id}/staging/{cr_id}"
        ))
    }

    /// Live-edit scratch area for a client session token. The token is an
    /// opaque client string, so it is sanitized before touching a path.
    pub fn live_edit(project_id: Uuid, dataset_id: Uuid, session: &str) -> Self {
        let safe: String = session
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .take(64)
            .collect();
        Self::new(format!(
            "projects/{project_id}/datasets/{dataset_id}/live_edit/{safe}"
        ))
    }
}

/// A page of rows read from a table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub total: usize,
}

/// One staged row: an upsert, or a deletion of `key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedRow {
    pub key: String,
    pub data: Row,
    #[serde(default)]
    pub deleted: bool,
}

/// Table counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    pub row_count: i64,
    pub column_count: i64,
    pub current_version: i64,
}

/// One entry of a table's operation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableOp {
    pub version: i64,
    pub op: String,
    pub timestamp: DateTime<Utc>,
    pub rows_added: i64,
    pub rows_updated: i64,
    pub rows_deleted: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<i64>,
}

/// Options for a merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    /// Whether staged deletion markers are applied.
    pub apply_deletes: bool,
}

/// Outcome of a merge commit.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub version_before: i64,
    pub version_after: i64,
    pub rows_added: i64,
    pub rows_updated: i64,
    pub rows_deleted: i64,
}

/// Storage-level failures, mapped to user-facing errors at the service
/// boundary.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("table not found")]
    TableNotFound,

    #[error("version {0} not found")]
    VersionNotFound(i64),

    #[error("{0}")]
    Unsupported(String),

    #[error("storage I/O failed")]
    Io(#[from] std::io::Error),

    #[error("storage query failed")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The contract both backends implement.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create the table if it does not exist, recording its columns.
    async fn ensure(&self, table: &TableRef, columns: &[String]) -> StorageResult<()>;

    /// Append rows, producing a new version. Returns the new version.
    async fn append(
        &self,
        table: &TableRef,
        rows: &[Row],
        primary_keys: &[String],
    ) -> StorageResult<i64>;

    /// Read a page of rows, optionally at a historical version.
    async fn read(
        &self,
        table: &TableRef,
        at_version: Option<i64>,
        limit: usize,
        offset: usize,
    ) -> StorageResult<RowSet>;

    /// Current row/column counts and version.
    async fn stats(&self, table: &TableRef) -> StorageResult<TableStats>;

    /// Apply a staging area onto the table as one atomic commit: upsert
    /// on primary key, insert on absence, optional deletes. Retrying the
    /// same staging source converges to the same contents.
    async fn merge(
        &self,
        table: &TableRef,
        staging: &TableRef,
        primary_keys: &[String],
        options: MergeOptions,
    ) -> StorageResult<MergeOutcome>;

    /// Operation history, oldest first.
    async fn history(&self, table: &TableRef) -> StorageResult<Vec<TableOp>>;

    /// Produce a new version whose contents equal `version`.
    async fn restore(&self, table: &TableRef, version: i64) -> StorageResult<TableOp>;

    /// Replace the contents of a staging area.
    async fn write_staging(&self, staging: &TableRef, rows: &[StagedRow]) -> StorageResult<()>;

    /// Read a page of a staging area. Returns the page and the total count.
    async fn read_staging(
        &self,
        staging: &TableRef,
        limit: usize,
        offset: usize,
    ) -> StorageResult<(Vec<StagedRow>, usize)>;

    /// Remove a staging area. Idempotent: absent staging is success.
    async fn destroy_staging(&self, staging: &TableRef) -> StorageResult<()>;
}

/// Derive the row key for a row under the given primary key columns.
///
/// Missing key columns contribute an empty segment so the derivation is
/// total; validation catches rows without keys before they get here.
pub fn row_key(row: &Row, primary_keys: &[String]) -> String {
    primary_keys
        .iter()
        .map(|k| match row.get(k) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Column names observed across a set of rows, first-seen order.
pub fn observed_columns(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn table_paths_derive_from_ids_only() {
        let p = Uuid::nil();
        let d = Uuid::nil();
        let cr = Uuid::nil();

        let main = TableRef::main(p, d);
        assert!(main.key.ends_with("/main"));

        let staging = TableRef::staging(p, d, cr);
        assert!(staging.key.contains("/staging/"));
        assert!(staging.key.starts_with(&format!("projects/{p}/")));
    }

    #[test]
    fn live_edit_session_tokens_are_sanitized() {
        let t = TableRef::live_edit(Uuid::nil(), Uuid::nil(), "../../etc/passwd");
        assert!(!t.key.contains(".."));
        assert!(!t.key.contains("/etc"));
    }

    #[test]
    fn row_keys_join_primary_key_columns() {
        let r = row(&[("id", json!(7)), ("region", json!("eu")), ("x", json!(1))]);
        assert_eq!(row_key(&r, &["id".to_string()]), "7");
        assert_eq!(
            row_key(&r, &["id".to_string(), "region".to_string()]),
            "7|eu"
        );
        assert_eq!(row_key(&r, &["missing".to_string()]), "");
    }

    #[test]
    fn observed_columns_keep_first_seen_order() {
        let rows = vec![
            row(&[("b", json!(1)), ("a", json!(2))]),
            row(&[("c", json!(3)), ("a", json!(4))]),
        ];
        // serde_json::Map preserves insertion order only with the
        // preserve_order feature; observed_columns is order-stable over
        // whatever iteration order the map provides.
        let cols = observed_columns(&rows);
        assert_eq!(cols.len(), 3);
        assert!(cols.contains(&"a".to_string()));
        assert!(cols.contains(&"c".to_string()));
    }
}
