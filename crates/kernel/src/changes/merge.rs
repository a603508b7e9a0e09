//! Merge execution.
//!
//! Applies an approved change request's staging area onto the dataset's
//! main table as one atomic commit. The executor owns the advisory lock
//! (the `approved → merging` status CAS), the merge-time validation gate,
//! conflict detection against the recorded base version, the diff
//! summary, audit artifacts, and the dataset metadata update.
//!
//! Ordering matters: the backend commit happens first, then audit
//! artifacts and metadata, then the status flip to `merged`. If anything
//! after the backend commit fails, the change request is parked in
//! `cleanup_pending` for the sweeper — the data plane result stands.

use std::collections::HashSet;

use sqlx::PgPool;
use uuid::Uuid;

use crate::audit::{AuditRecorder, kinds};
use crate::changes::diff::{DiffSummary, compute_diff, projected_image};
use crate::changes::machine::CrState;
use crate::error::{AppError, AppResult};
use crate::models::{
    ChangeRequest, CrEvent, CrKind, Dataset, DatasetMeta, NewAuditEvent,
};
use crate::staging::{StagingManager, storage_error};
use crate::storage::{MergeOptions, Row, StagedRow, TableRef, row_key};
use crate::validation::{
    ValidationSummary, Validator, validate_rows_with_deadline,
};

/// Result of a successful merge.
#[derive(Debug, Clone)]
pub struct MergeApplied {
    pub version_before: i64,
    pub version_after: i64,
    pub diff: DiffSummary,
    /// True when cleanup already ran and the CR is closed; false when the
    /// sweeper still owes a cleanup pass.
    pub cleaned_up: bool,
}

/// Merge executor.
#[derive(Clone)]
pub struct MergeExecutor {
    pool: PgPool,
    staging: StagingManager,
    audit: AuditRecorder,
    validation_deadline: std::time::Duration,
}

impl MergeExecutor {
    pub fn new(
        pool: PgPool,
        staging: StagingManager,
        audit: AuditRecorder,
        validation_deadline: std::time::Duration,
    ) -> Self {
        Self {
            pool,
            staging,
            audit,
            validation_deadline,
        }
    }

    /// Run the full merge pipeline for an approved change request.
    ///
    /// `force` (already authorized as owner by the caller) bypasses only
    /// the row-overlap conflict guard; the validation gate always runs.
    pub async fn execute(
        &self,
        cr: &ChangeRequest,
        dataset: &Dataset,
        requested_by: Uuid,
        force: bool,
    ) -> AppResult<MergeApplied> {
        // Advisory lock: only one merge per CR, and transitively one per
        // dataset, since only an approved CR can enter `merging`.
        let locked = ChangeRequest::cas_status(
            &self.pool,
            cr.id,
            CrState::Approved.as_str(),
            CrState::Merging.as_str(),
        )
        .await?;
        if !locked {
            return Err(AppError::StaleState);
        }

        match self.run_locked(cr, dataset, requested_by, force).await {
            Ok(applied) => Ok(applied),
            Err(err) => {
                self.fail_merge(cr, requested_by, &err).await;
                Err(err)
            }
        }
    }

    async fn run_locked(
        &self,
        cr: &ChangeRequest,
        dataset: &Dataset,
        requested_by: Uuid,
        force: bool,
    ) -> AppResult<MergeApplied> {
        let backend = self.staging.router().for_dataset(dataset);
        let main = TableRef::main(dataset.project_id, dataset.id);
        let primary_keys = dataset.primary_keys();
        let apply_deletes = cr.kind.as_str() == CrKind::LiveEdit.as_str();

        let staged = self.staging.staged_rows(dataset, cr.id).await?;
        let pre = backend
            .read(&main, None, usize::MAX, 0)
            .await
            .map_err(storage_error)?;

        // Merge-time validation runs against the projected post-merge
        // image, not the staging rows alone.
        let image = projected_image(&pre.rows, &staged, &primary_keys, apply_deletes);
        let validator = Validator::new(
            dataset.table_schema.as_ref().map(|s| s.0.clone()),
            dataset.rules.as_ref().map(|r| r.0.clone()),
        );
        let validation =
            validate_rows_with_deadline(&validator, &image, self.validation_deadline).await;
        if validation.blocks_merge() {
            return Err(AppError::ValidationBlocked(validation));
        }

        // Conflict guard: the dataset must still be at the version the CR
        // was opened against, unless the concurrent writes and this
        // change touch disjoint rows.
        let meta = DatasetMeta::find(&self.pool, dataset.id)
            .await?
            .ok_or(AppError::NotFound)?;
        if let Some(base) = cr.version_before
            && meta.current_version != base
            && !force
        {
            let conflicts = self
                .overlapping_keys(dataset, &main, base, &pre.rows, &staged, &primary_keys)
                .await?;
            if !conflicts.is_empty() {
                return Err(AppError::Conflict(conflicts));
            }
        }

        let diff = compute_diff(&pre.rows, &staged, &primary_keys, apply_deletes);

        // Atomic backend commit. Everything after this point must not
        // undo the data-plane result.
        let staging_ref = StagingManager::staging_ref(dataset, cr.id);
        let outcome = backend
            .merge(
                &main,
                &staging_ref,
                &primary_keys,
                MergeOptions { apply_deletes },
            )
            .await
            .map_err(storage_error)?;

        let summary = serde_json::to_string(&diff).unwrap_or_default();

        if let Err(e) = self
            .record_success(cr, dataset, requested_by, force, &diff, &validation, &outcome)
            .await
        {
            // The table is merged; audit or metadata is not. Park for the
            // sweeper rather than failing the data plane.
            tracing::error!(error = %e, cr_id = %cr.id, "merge committed but bookkeeping failed");
            let _ = ChangeRequest::record_merge(
                &self.pool,
                cr.id,
                outcome.version_before,
                outcome.version_after,
                &summary,
            )
            .await;
            let _ = ChangeRequest::cas_status(
                &self.pool,
                cr.id,
                CrState::Merging.as_str(),
                CrState::CleanupPending.as_str(),
            )
            .await;
            return Ok(MergeApplied {
                version_before: outcome.version_before,
                version_after: outcome.version_after,
                diff,
                cleaned_up: false,
            });
        }

        let cleaned_up = match self.finish_merged(cr, dataset, requested_by, &diff, &outcome, &summary).await {
            Ok(cleaned_up) => cleaned_up,
            Err(e) => {
                tracing::error!(error = %e, cr_id = %cr.id, "merged but closing failed; parking for sweeper");
                let _ = ChangeRequest::cas_status(
                    &self.pool,
                    cr.id,
                    CrState::Merging.as_str(),
                    CrState::CleanupPending.as_str(),
                )
                .await;
                let _ = ChangeRequest::cas_status(
                    &self.pool,
                    cr.id,
                    CrState::Merged.as_str(),
                    CrState::CleanupPending.as_str(),
                )
                .await;
                false
            }
        };

        Ok(MergeApplied {
            version_before: outcome.version_before,
            version_after: outcome.version_after,
            diff,
            cleaned_up,
        })
    }

    /// Post-commit bookkeeping: record the merge on the CR row, flip to
    /// `merged`, destroy staging, and close. Any failure in here leaves
    /// the data-plane result intact.
    async fn finish_merged(
        &self,
        cr: &ChangeRequest,
        dataset: &Dataset,
        requested_by: Uuid,
        diff: &DiffSummary,
        outcome: &crate::storage::MergeOutcome,
        summary: &str,
    ) -> anyhow::Result<bool> {
        ChangeRequest::record_merge(
            &self.pool,
            cr.id,
            outcome.version_before,
            outcome.version_after,
            summary,
        )
        .await?;
        ChangeRequest::cas_status(
            &self.pool,
            cr.id,
            CrState::Merging.as_str(),
            CrState::Merged.as_str(),
        )
        .await?;
        CrEvent::record(
            &self.pool,
            cr.id,
            "merged",
            Some(requested_by),
            &format!(
                "Merged at version {} ({} added, {} updated, {} deleted)",
                outcome.version_after, diff.rows_added, diff.rows_updated, diff.rows_deleted
            ),
        )
        .await?;

        // Cleanup: destroy staging and close. A failure here parks the CR
        // for the sweeper instead of surfacing to the caller.
        match self.staging.destroy(dataset, cr.id).await {
            Ok(()) => {
                ChangeRequest::cas_status(
                    &self.pool,
                    cr.id,
                    CrState::Merged.as_str(),
                    CrState::Closed.as_str(),
                )
                .await?;
                CrEvent::record(&self.pool, cr.id, "cleanup", None, "Staging removed").await?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, cr_id = %cr.id, "staging cleanup deferred to sweeper");
                ChangeRequest::cas_status(
                    &self.pool,
                    cr.id,
                    CrState::Merged.as_str(),
                    CrState::CleanupPending.as_str(),
                )
                .await?;
                Ok(false)
            }
        }
    }

    /// Keys touched both by concurrent writes (base..current) and by this
    /// change request's staging rows.
    async fn overlapping_keys(
        &self,
        dataset: &Dataset,
        main: &TableRef,
        base_version: i64,
        current_rows: &[Row],
        staged: &[StagedRow],
        primary_keys: &[String],
    ) -> AppResult<Vec<String>> {
        let staged_keys: HashSet<String> = staged.iter().map(|s| s.key.clone()).collect();
        let backend = self.staging.router().for_dataset(dataset);

        let changed_since_base: HashSet<String> = match backend
            .read(main, Some(base_version), usize::MAX, 0)
            .await
        {
            Ok(base_rows) => {
                let base_by_key: std::collections::HashMap<String, &Row> = base_rows
                    .rows
                    .iter()
                    .map(|row| (row_key(row, primary_keys), row))
                    .collect();
                let current_by_key: std::collections::HashMap<String, &Row> = current_rows
                    .iter()
                    .map(|row| (row_key(row, primary_keys), row))
                    .collect();

                let mut changed = HashSet::new();
                for (key, row) in &current_by_key {
                    if base_by_key.get(key) != Some(row) {
                        changed.insert(key.clone());
                    }
                }
                for key in base_by_key.keys() {
                    if !current_by_key.contains_key(key) {
                        changed.insert(key.clone());
                    }
                }
                changed
            }
            // Without time travel the concurrent writes cannot be
            // narrowed down; treat every current row as potentially
            // changed.
            Err(_) => current_rows
                .iter()
                .map(|row| row_key(row, primary_keys))
                .collect(),
        };

        let mut overlap: Vec<String> = staged_keys
            .intersection(&changed_since_base)
            .cloned()
            .collect();
        overlap.sort();

        Ok(overlap)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_success(
        &self,
        cr: &ChangeRequest,
        dataset: &Dataset,
        requested_by: Uuid,
        force: bool,
        diff: &DiffSummary,
        validation: &ValidationSummary,
        outcome: &crate::storage::MergeOutcome,
    ) -> anyhow::Result<()> {
        let metadata = serde_json::json!({
            "change_request_id": cr.id,
            "dataset_id": dataset.id,
            "version_before": outcome.version_before,
            "version_after": outcome.version_after,
            "requested_by": requested_by,
            "forced": force,
        });
        self.audit
            .write_merge_artifacts(cr.id, diff, validation, &metadata)
            .await?;

        let stats = self
            .staging
            .router()
            .for_dataset(dataset)
            .stats(&TableRef::main(dataset.project_id, dataset.id))
            .await
            .map_err(|e| anyhow::anyhow!("failed to read post-merge stats: {e}"))?;

        DatasetMeta::record_update(
            &self.pool,
            dataset.id,
            outcome.version_after,
            stats.row_count,
            stats.column_count as i32,
        )
        .await?;

        let description = if force {
            format!(
                "Change request {} merged with force_merge by owner",
                cr.public_id
            )
        } else {
            format!("Change request {} merged", cr.public_id)
        };

        self.audit
            .record(NewAuditEvent {
                project_id: dataset.project_id,
                dataset_id: dataset.id,
                kind: kinds::CR_MERGED.to_string(),
                title: cr.title.clone(),
                description,
                actor_user_id: Some(requested_by),
                change_request_id: Some(cr.id),
                snapshot_version: Some(outcome.version_after),
                rows_added: diff.rows_added,
                rows_updated: diff.rows_updated,
                rows_deleted: diff.rows_deleted,
            })
            .await?;

        Ok(())
    }

    /// Release the lock after a pre-commit failure: back to review with a
    /// `merge_failed` event. Validation and conflict failures are
    /// retryable after the CR is fixed up or re-approved.
    async fn fail_merge(&self, cr: &ChangeRequest, actor: Uuid, err: &AppError) {
        let message = match err {
            AppError::ValidationBlocked(_) => "Merge blocked by validation".to_string(),
            AppError::Conflict(keys) => {
                format!("Merge conflict on {} row(s)", keys.len())
            }
            other => format!("Merge failed: {other}"),
        };

        if let Err(e) = ChangeRequest::cas_status(
            &self.pool,
            cr.id,
            CrState::Merging.as_str(),
            CrState::PendingReview.as_str(),
        )
        .await
        {
            tracing::error!(error = %e, cr_id = %cr.id, "failed to release merge lock");
        }

        if let Err(e) =
            CrEvent::record(&self.pool, cr.id, "merge_failed", Some(actor), &message).await
        {
            tracing::error!(error = %e, cr_id = %cr.id, "failed to record merge failure event");
        }
    }
}
