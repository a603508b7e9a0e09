//! Background reconciliation.
//!
//! The sweeper retries what the merge pipeline deferred: destroying
//! staging areas for `cleanup_pending` change requests, re-recording any
//! audit event that was lost between the backend commit and the catalog
//! write, closing merged CRs, and releasing merge locks abandoned by a
//! crashed or timed-out merge.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audit::{AuditRecorder, kinds};
use crate::changes::diff::DiffSummary;
use crate::changes::machine::CrState;
use crate::models::{AuditEvent, ChangeRequest, CrEvent, Dataset, NewAuditEvent};
use crate::staging::StagingManager;

/// A merge lock older than this is considered abandoned.
const STALE_MERGE_AFTER: Duration = Duration::from_secs(300);

/// Summary of one sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub closed: u64,
    pub reconciled: u64,
    pub released: u64,
}

/// Background cleanup service.
#[derive(Clone)]
pub struct Sweeper {
    pool: PgPool,
    staging: StagingManager,
    audit: AuditRecorder,
}

impl Sweeper {
    pub fn new(pool: PgPool, staging: StagingManager, audit: AuditRecorder) -> Self {
        Self {
            pool,
            staging,
            audit,
        }
    }

    /// Run sweeps on an interval until `shutdown` flips.
    pub fn spawn(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(report) if report.closed + report.reconciled + report.released > 0 => {
                                info!(
                                    closed = report.closed,
                                    reconciled = report.reconciled,
                                    released = report.released,
                                    "sweep finished"
                                );
                            }
                            Ok(_) => debug!("sweep finished with nothing to do"),
                            Err(e) => warn!(error = %e, "sweep failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("sweeper stopping");
                        break;
                    }
                }
            }
        });
    }

    /// One full sweep pass.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for cr in ChangeRequest::list_with_status(&self.pool, CrState::CleanupPending.as_str())
            .await?
        {
            match self.finish_cleanup(&cr, true).await {
                Ok(reconciled) => {
                    report.closed += 1;
                    if reconciled {
                        report.reconciled += 1;
                    }
                }
                Err(e) => warn!(error = %e, cr_id = %cr.id, "cleanup retry failed"),
            }
        }

        // Merged CRs whose in-line cleanup never ran (crash between the
        // status flip and the staging destroy).
        for cr in ChangeRequest::list_with_status(&self.pool, CrState::Merged.as_str()).await? {
            match self.finish_cleanup(&cr, false).await {
                Ok(_) => report.closed += 1,
                Err(e) => warn!(error = %e, cr_id = %cr.id, "merged cleanup failed"),
            }
        }

        report.released += self.release_stale_merges().await?;

        Ok(report)
    }

    /// Destroy staging, make sure the merge audit event exists, and close.
    async fn finish_cleanup(&self, cr: &ChangeRequest, reconcile_audit: bool) -> Result<bool> {
        let dataset = Dataset::find_by_id(&self.pool, cr.dataset_id)
            .await?
            .context("dataset vanished under a change request")?;

        self.staging
            .destroy(&dataset, cr.id)
            .await
            .map_err(|e| anyhow::anyhow!("failed to destroy staging: {e}"))?;

        let mut reconciled = false;
        if reconcile_audit {
            reconciled = self.reconcile_audit(cr, &dataset).await?;
        }

        let from = CrState::parse(&cr.status).context("unparseable change request status")?;
        ChangeRequest::cas_status(&self.pool, cr.id, from.as_str(), CrState::Closed.as_str())
            .await?;
        CrEvent::record(&self.pool, cr.id, "cleanup", None, "Staging removed by sweeper").await?;

        Ok(reconciled)
    }

    /// Re-append the `cr.merged` audit event if the original write was
    /// lost after the backend commit.
    async fn reconcile_audit(&self, cr: &ChangeRequest, dataset: &Dataset) -> Result<bool> {
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_events WHERE change_request_id = $1 AND kind = $2",
        )
        .bind(cr.id)
        .bind(kinds::CR_MERGED)
        .fetch_one(&self.pool)
        .await?;
        if existing > 0 {
            return Ok(false);
        }

        let diff: DiffSummary = cr
            .summary
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();

        let _: AuditEvent = self
            .audit
            .record(NewAuditEvent {
                project_id: cr.project_id,
                dataset_id: dataset.id,
                kind: kinds::CR_MERGED.to_string(),
                title: cr.title.clone(),
                description: format!("Change request {} merged (reconciled)", cr.public_id),
                actor_user_id: None,
                change_request_id: Some(cr.id),
                snapshot_version: cr.version_after,
                rows_added: diff.rows_added,
                rows_updated: diff.rows_updated,
                rows_deleted: diff.rows_deleted,
            })
            .await?;

        Ok(true)
    }

    /// Return long-abandoned `merging` CRs to review.
    async fn release_stale_merges(&self) -> Result<u64> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(STALE_MERGE_AFTER).unwrap_or(chrono::Duration::zero());

        let mut released = 0u64;
        for cr in ChangeRequest::list_with_status(&self.pool, CrState::Merging.as_str()).await? {
            if cr.updated_at > cutoff {
                continue;
            }
            let moved = ChangeRequest::cas_status(
                &self.pool,
                cr.id,
                CrState::Merging.as_str(),
                CrState::PendingReview.as_str(),
            )
            .await?;
            if moved {
                CrEvent::record(
                    &self.pool,
                    cr.id,
                    "merge_failed",
                    None,
                    "Merge abandoned; returned to review",
                )
                .await?;
                released += 1;
            }
        }

        Ok(released)
    }
}
