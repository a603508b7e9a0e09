//! Per-CR staging areas.
//!
//! Every change request materializes its proposed rows in an isolated
//! staging area addressed by (project, dataset, CR). Previews,
//! re-validation, and the merge all read the same staged bytes. Staging
//! is never visible to dataset readers and is destroyed before a change
//! request closes.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Dataset, EditSet, StorageKind};
use crate::storage::{
    RelationalBackend, Row, StagedRow, StorageBackend, StorageError, TableRef, VersionedBackend,
    row_key,
};

/// Selects the backend a dataset lives on.
#[derive(Clone)]
pub struct StorageRouter {
    versioned: Arc<VersionedBackend>,
    relational: Arc<RelationalBackend>,
}

impl StorageRouter {
    pub fn new(versioned: Arc<VersionedBackend>, relational: Arc<RelationalBackend>) -> Self {
        Self {
            versioned,
            relational,
        }
    }

    pub fn for_kind(&self, kind: StorageKind) -> Arc<dyn StorageBackend> {
        match kind {
            StorageKind::Versioned => self.versioned.clone(),
            StorageKind::Relational => self.relational.clone(),
        }
    }

    pub fn for_dataset(&self, dataset: &Dataset) -> Arc<dyn StorageBackend> {
        self.for_kind(dataset.storage_kind())
    }
}

/// A page of staged data for preview.
#[derive(Debug, Clone, Serialize)]
pub struct StagingPreview {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub total: usize,
    pub deleted_rows: Vec<String>,
}

/// Creates, reads, and destroys staging areas.
#[derive(Clone)]
pub struct StagingManager {
    router: StorageRouter,
}

impl StagingManager {
    pub fn new(router: StorageRouter) -> Self {
        Self { router }
    }

    /// Staging location for a change request.
    pub fn staging_ref(dataset: &Dataset, cr_id: Uuid) -> TableRef {
        TableRef::staging(dataset.project_id, dataset.id, cr_id)
    }

    /// Materialize parsed upload rows as the CR's staging area.
    pub async fn stage_append(
        &self,
        dataset: &Dataset,
        cr_id: Uuid,
        rows: &[Row],
    ) -> AppResult<TableRef> {
        if rows.is_empty() {
            return Err(AppError::InvalidPayload("no rows to stage".to_string()));
        }

        let keys = dataset.primary_keys();
        let staged: Vec<StagedRow> = rows
            .iter()
            .map(|row| StagedRow {
                key: row_key(row, &keys),
                data: row.clone(),
                deleted: false,
            })
            .collect();

        let staging = Self::staging_ref(dataset, cr_id);
        let backend = self.router.for_dataset(dataset);
        backend
            .write_staging(&staging, &staged)
            .await
            .map_err(storage_error)?;

        Ok(staging)
    }

    /// Materialize a live-edit set as the CR's staging area.
    ///
    /// Edited cells are applied on top of the current main-table rows so
    /// the staged row carries the full projected record; deletions become
    /// tombstone entries.
    pub async fn stage_edits(
        &self,
        dataset: &Dataset,
        cr_id: Uuid,
        edits: &EditSet,
    ) -> AppResult<TableRef> {
        if edits.cells.is_empty() && edits.deleted_rows.is_empty() {
            return Err(AppError::InvalidPayload("edit set is empty".to_string()));
        }

        let backend = self.router.for_dataset(dataset);
        let main = TableRef::main(dataset.project_id, dataset.id);
        let current = backend
            .read(&main, None, usize::MAX, 0)
            .await
            .map_err(storage_error)?;

        let keys = dataset.primary_keys();
        let mut by_key: std::collections::HashMap<String, Row> = current
            .rows
            .into_iter()
            .map(|row| (row_key(&row, &keys), row))
            .collect();

        let mut touched: Vec<String> = Vec::new();
        for cell in &edits.cells {
            let Some(row) = by_key.get_mut(&cell.row_key) else {
                return Err(AppError::InvalidPayload(format!(
                    "edited row '{}' does not exist",
                    cell.row_key
                )));
            };
            row.insert(cell.column.clone(), cell.value.clone());
            if !touched.contains(&cell.row_key) {
                touched.push(cell.row_key.clone());
            }
        }

        let mut staged: Vec<StagedRow> = touched
            .iter()
            .filter_map(|key| {
                by_key.get(key).map(|row| StagedRow {
                    key: key.clone(),
                    data: row.clone(),
                    deleted: false,
                })
            })
            .collect();

        for key in &edits.deleted_rows {
            if !by_key.contains_key(key) {
                return Err(AppError::InvalidPayload(format!(
                    "deleted row '{key}' does not exist"
                )));
            }
            staged.push(StagedRow {
                key: key.clone(),
                data: Row::new(),
                deleted: true,
            });
        }

        let staging = Self::staging_ref(dataset, cr_id);
        backend
            .write_staging(&staging, &staged)
            .await
            .map_err(storage_error)?;

        Ok(staging)
    }

    /// Staged rows for validation or merge projection.
    pub async fn staged_rows(&self, dataset: &Dataset, cr_id: Uuid) -> AppResult<Vec<StagedRow>> {
        let staging = Self::staging_ref(dataset, cr_id);
        let backend = self.router.for_dataset(dataset);
        let (rows, _) = backend
            .read_staging(&staging, usize::MAX, 0)
            .await
            .map_err(storage_error)?;

        Ok(rows)
    }

    /// A restartable preview page of the staged change.
    pub async fn preview(
        &self,
        dataset: &Dataset,
        cr_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> AppResult<StagingPreview> {
        let staging = Self::staging_ref(dataset, cr_id);
        let backend = self.router.for_dataset(dataset);
        let (page, total) = backend
            .read_staging(&staging, limit, offset)
            .await
            .map_err(storage_error)?;

        let mut deleted_rows = Vec::new();
        let mut rows = Vec::new();
        for staged in page {
            if staged.deleted {
                deleted_rows.push(staged.key);
            } else {
                rows.push(staged.data);
            }
        }

        let columns = crate::storage::observed_columns(&rows);

        Ok(StagingPreview {
            columns,
            rows,
            total,
            deleted_rows,
        })
    }

    /// Remove the staging area. Safe to call repeatedly.
    pub async fn destroy(&self, dataset: &Dataset, cr_id: Uuid) -> AppResult<()> {
        let staging = Self::staging_ref(dataset, cr_id);
        let backend = self.router.for_dataset(dataset);
        backend
            .destroy_staging(&staging)
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    pub fn router(&self) -> &StorageRouter {
        &self.router
    }
}

/// Map storage failures to user-facing errors.
pub fn storage_error(err: StorageError) -> AppError {
    match err {
        StorageError::TableNotFound => AppError::NotFound,
        StorageError::VersionNotFound(_) => AppError::NotFound,
        StorageError::Unsupported(msg) => AppError::InvalidPayload(msg),
        StorageError::Io(e) => {
            tracing::error!(error = %e, "storage I/O failure");
            AppError::EngineUnreachable
        }
        StorageError::Db(e) => {
            tracing::error!(error = %e, "storage query failure");
            AppError::EngineUnreachable
        }
        StorageError::Other(e) => AppError::Internal(e),
    }
}
