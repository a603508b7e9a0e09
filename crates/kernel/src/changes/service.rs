//! Change request orchestration.
//!
//! Every mutation to a dataset flows through here: opening a change
//! request stages and validates the proposed rows, reviewers act on it,
//! quorum hands it to the merge executor, and terminal states fan out
//! notifications. Authorization against project roles happens in the
//! routes; this service enforces pipeline invariants (reviewer
//! membership, payload presence, machine-legal transitions).

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::changes::machine::{CrEventKind, CrState, next_state};
use crate::changes::merge::{MergeApplied, MergeExecutor};
use crate::error::{AppError, AppResult};
use crate::ingest;
use crate::models::{
    ChangeRequest, CrComment, CrEvent, CrKind, Dataset, DatasetMeta, EditSet, NewChangeRequest,
    Project, ReviewerDecision, Upload, User,
};
use crate::notify::Notifier;
use crate::staging::{StagingManager, StagingPreview};
use crate::validation::{Validator, validate_rows_with_deadline};

/// Reviewer-state writes retry this many times on row-version conflicts.
const REVIEWER_WRITE_RETRIES: u32 = 3;

/// What an approve call should do, given the CR state and the actor's
/// recorded decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApproveGate {
    /// Record the approval; the actor had not decided yet.
    Record,
    /// Repeat approval while review is still open: no state to write,
    /// but a stalled quorum may still be driven to merge.
    RepeatOpen,
    /// Repeat approval after the CR settled: return the current CR
    /// unchanged.
    RepeatSettled,
}

/// Gate an approve call. Approvals are idempotent per (CR, reviewer):
/// a repeat approval never errors, even when the first one already
/// carried the CR through merge.
fn approve_gate(
    state: CrState,
    decision: Option<ReviewerDecision>,
) -> Result<ApproveGate, AppError> {
    let Some(decision) = decision else {
        return Err(AppError::Forbidden);
    };

    match (state, decision) {
        (CrState::PendingReview, ReviewerDecision::Approved) => Ok(ApproveGate::RepeatOpen),
        (CrState::PendingReview, _) => Ok(ApproveGate::Record),
        (_, ReviewerDecision::Approved) => Ok(ApproveGate::RepeatSettled),
        _ => Err(AppError::NotPending),
    }
}

/// Gate a reject call: reviewers only, and only while review is open.
fn reject_gate(state: CrState, decision: Option<ReviewerDecision>) -> Result<(), AppError> {
    if decision.is_none() {
        return Err(AppError::Forbidden);
    }
    if state != CrState::PendingReview {
        return Err(AppError::NotPending);
    }
    Ok(())
}

/// Gate a withdraw call: the requester only, and only while review is
/// open. Ownership is checked first so a stranger never learns the CR's
/// state from the error.
fn withdraw_gate(state: CrState, is_requester: bool) -> Result<(), AppError> {
    if !is_requester {
        return Err(AppError::NotOwnerOfChange);
    }
    if state != CrState::PendingReview {
        return Err(AppError::NotPending);
    }
    Ok(())
}

/// Exact message returned while approvals are still outstanding.
pub const WAITING_FOR_REVIEWERS: &str = "Waiting for all reviewers to approve.";

/// Outcome of an approve call.
#[derive(Debug)]
pub struct ApproveOutcome {
    pub cr: ChangeRequest,
    pub message: String,
    pub merged: Option<MergeApplied>,
}

/// Input for opening an append change request.
#[derive(Debug)]
pub struct OpenAppend {
    pub upload_id: Uuid,
    pub reviewer_ids: Vec<Uuid>,
    pub title: String,
    pub comment: Option<String>,
}

/// Input for opening a live-edit change request.
#[derive(Debug)]
pub struct OpenLiveEdit {
    pub session_id: Option<String>,
    pub reviewer_ids: Vec<Uuid>,
    pub title: String,
    pub edits: EditSet,
    pub comment: Option<String>,
}

/// Change request orchestrator.
#[derive(Clone)]
pub struct ChangeService {
    pool: PgPool,
    staging: StagingManager,
    merge: MergeExecutor,
    notifier: Notifier,
    validation_deadline: Duration,
    merge_timeout: Duration,
}

impl ChangeService {
    pub fn new(
        pool: PgPool,
        staging: StagingManager,
        merge: MergeExecutor,
        notifier: Notifier,
        validation_deadline: Duration,
        merge_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            staging,
            merge,
            notifier,
            validation_deadline,
            merge_timeout,
        }
    }

    fn validator_for(dataset: &Dataset) -> Validator {
        Validator::new(
            dataset.table_schema.as_ref().map(|s| s.0.clone()),
            dataset.rules.as_ref().map(|r| r.0.clone()),
        )
    }

    /// Reviewer ids must be project members; the requester may not review
    /// their own change.
    async fn check_reviewers(
        &self,
        project: &Project,
        reviewer_ids: &[Uuid],
    ) -> AppResult<()> {
        if reviewer_ids.is_empty() {
            return Err(AppError::InvalidPayload(
                "at least one reviewer is required".to_string(),
            ));
        }

        let members = Project::member_ids(&self.pool, project.id).await?;
        for reviewer in reviewer_ids {
            if !members.contains(reviewer) {
                return Err(AppError::ReviewerNotMember);
            }
        }

        Ok(())
    }

    /// Open an append change request from a stored upload.
    pub async fn open_append(
        &self,
        project: &Project,
        dataset: &Dataset,
        actor: &User,
        input: OpenAppend,
    ) -> AppResult<ChangeRequest> {
        if dataset.project_id != project.id {
            return Err(AppError::NotFound);
        }
        self.check_reviewers(project, &input.reviewer_ids).await?;

        let upload = Upload::find_by_id(&self.pool, input.upload_id)
            .await?
            .filter(|u| u.dataset_id == dataset.id)
            .ok_or_else(|| {
                AppError::InvalidPayload("upload does not exist for this dataset".to_string())
            })?;

        let bytes = Upload::content(&self.pool, upload.id)
            .await?
            .ok_or(AppError::NotFound)?;
        let format = ingest::format_for_filename(&upload.filename)?;
        let schema = dataset.table_schema.as_ref().map(|s| &s.0);
        let rows = ingest::parse_upload(&bytes, format, schema)?;

        let meta = DatasetMeta::find(&self.pool, dataset.id)
            .await?
            .ok_or(AppError::NotFound)?;

        let cr = ChangeRequest::create(
            &self.pool,
            NewChangeRequest {
                project_id: project.id,
                dataset_id: dataset.id,
                kind: CrKind::Append,
                status: CrState::Draft.as_str().to_string(),
                title: input.title,
                requester_user_id: actor.id,
                reviewers: input.reviewer_ids.clone(),
                upload_id: Some(upload.id),
                edit_set: None,
                version_before: Some(meta.current_version),
            },
        )
        .await?;
        CrEvent::record(&self.pool, cr.id, "created", Some(actor.id), "Change request created")
            .await?;

        if let Err(e) = self.staging.stage_append(dataset, cr.id, &rows).await {
            self.discard_draft(&cr, dataset).await;
            return Err(e);
        }
        let cr = self.submit(cr, dataset, actor, &rows).await?;

        if let Some(comment) = input.comment.filter(|c| !c.trim().is_empty()) {
            CrComment::create(&self.pool, cr.id, actor.id, &comment).await?;
        }

        self.notifier
            .notify_many(
                &input.reviewer_ids,
                Some(actor.id),
                &format!("Review requested: {}", cr.title),
                serde_json::json!({
                    "change_request_id": cr.public_id,
                    "project_id": project.public_id,
                }),
            )
            .await;

        Ok(cr)
    }

    /// Open a live-edit change request from an edit set.
    pub async fn open_live_edit(
        &self,
        project: &Project,
        dataset: &Dataset,
        actor: &User,
        input: OpenLiveEdit,
    ) -> AppResult<ChangeRequest> {
        if dataset.project_id != project.id {
            return Err(AppError::NotFound);
        }
        self.check_reviewers(project, &input.reviewer_ids).await?;

        // Session-level validation gates before anything is staged.
        let validator = Self::validator_for(dataset);
        let cells: Vec<(String, String, serde_json::Value)> = input
            .edits
            .cells
            .iter()
            .map(|c| (c.row_key.clone(), c.column.clone(), c.value.clone()))
            .collect();
        let session_summary = validator.validate_cells(&cells);
        if session_summary.blocks_submit() {
            return Err(AppError::ValidationBlocked(session_summary));
        }

        let meta = DatasetMeta::find(&self.pool, dataset.id)
            .await?
            .ok_or(AppError::NotFound)?;

        let mut edits = input.edits;
        edits.session_id = input.session_id;

        let cr = ChangeRequest::create(
            &self.pool,
            NewChangeRequest {
                project_id: project.id,
                dataset_id: dataset.id,
                kind: CrKind::LiveEdit,
                status: CrState::Draft.as_str().to_string(),
                title: input.title,
                requester_user_id: actor.id,
                reviewers: input.reviewer_ids.clone(),
                upload_id: None,
                edit_set: Some(edits.clone()),
                version_before: Some(meta.current_version),
            },
        )
        .await?;
        CrEvent::record(&self.pool, cr.id, "created", Some(actor.id), "Change request created")
            .await?;

        if let Err(e) = self.staging.stage_edits(dataset, cr.id, &edits).await {
            self.discard_draft(&cr, dataset).await;
            return Err(e);
        }
        let staged = self.staging.staged_rows(dataset, cr.id).await?;
        let rows: Vec<crate::storage::Row> = staged
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.data.clone())
            .collect();
        let cr = self.submit(cr, dataset, actor, &rows).await?;

        if let Some(comment) = input.comment.filter(|c| !c.trim().is_empty()) {
            CrComment::create(&self.pool, cr.id, actor.id, &comment).await?;
        }

        self.notifier
            .notify_many(
                &input.reviewer_ids,
                Some(actor.id),
                &format!("Review requested: {}", cr.title),
                serde_json::json!({
                    "change_request_id": cr.public_id,
                    "project_id": project.public_id,
                }),
            )
            .await;

        Ok(cr)
    }

    /// Remove a draft CR whose staging never materialized.
    async fn discard_draft(&self, cr: &ChangeRequest, dataset: &Dataset) {
        self.staging.destroy(dataset, cr.id).await.ok();
        if let Err(e) = sqlx::query("DELETE FROM change_requests WHERE id = $1")
            .bind(cr.id)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %e, cr_id = %cr.id, "failed to discard draft change request");
        }
    }

    /// Run CR-level validation and move draft → pending_review.
    ///
    /// On a blocked validation the staging area is destroyed and the
    /// creation is rolled back, so a rejected submission leaves nothing
    /// behind.
    async fn submit(
        &self,
        cr: ChangeRequest,
        dataset: &Dataset,
        actor: &User,
        rows: &[crate::storage::Row],
    ) -> AppResult<ChangeRequest> {
        let validator = Self::validator_for(dataset);
        let summary = validate_rows_with_deadline(&validator, rows, self.validation_deadline).await;

        if summary.blocks_submit() {
            self.staging.destroy(dataset, cr.id).await.ok();
            sqlx::query("DELETE FROM change_requests WHERE id = $1")
                .bind(cr.id)
                .execute(&self.pool)
                .await
                .ok();
            return Err(AppError::ValidationBlocked(summary));
        }

        let next = next_state(CrState::Draft, CrEventKind::Submit)
            .ok_or(AppError::NotPending)?;
        ChangeRequest::cas_status(&self.pool, cr.id, CrState::Draft.as_str(), next.as_str())
            .await?;
        CrEvent::record(
            &self.pool,
            cr.id,
            "submitted",
            Some(actor.id),
            "Submitted for review",
        )
        .await?;

        ChangeRequest::find_by_id(&self.pool, cr.id)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Approve on behalf of one reviewer.
    ///
    /// Idempotent per (change request, reviewer): a repeat approval
    /// returns the current state, including after the first call already
    /// drove the CR through merge. The last approval promotes the CR and
    /// runs the merge; if an earlier merge attempt failed, a repeat
    /// approval from any reviewer retries it.
    pub async fn approve(
        &self,
        cr: ChangeRequest,
        dataset: &Dataset,
        actor: &User,
        comment: Option<String>,
        force: bool,
    ) -> AppResult<ApproveOutcome> {
        let state = CrState::parse(&cr.status).ok_or(AppError::NotPending)?;
        let gate = approve_gate(state, cr.decision_for(actor.id))?;

        if gate == ApproveGate::RepeatSettled {
            return Ok(ApproveOutcome {
                cr,
                message: "Already approved.".to_string(),
                merged: None,
            });
        }

        let cr = match gate {
            ApproveGate::Record => {
                self.write_decision(&cr, actor.id, ReviewerDecision::Approved)
                    .await?
            }
            // Repeat while review is open; fall through so a stalled
            // approved CR can still be driven to merge.
            _ => cr,
        };

        if let Some(comment) = comment.filter(|c| !c.trim().is_empty()) {
            CrComment::create(&self.pool, cr.id, actor.id, &comment).await?;
        }
        if gate == ApproveGate::Record {
            CrEvent::record(&self.pool, cr.id, "approved", Some(actor.id), "Approved").await?;
        }

        if !cr.quorum_satisfied() {
            return Ok(ApproveOutcome {
                cr,
                message: WAITING_FOR_REVIEWERS.to_string(),
                merged: None,
            });
        }

        // Quorum: promote and merge. Of several concurrent last
        // approvers, exactly one wins this CAS and performs the merge.
        let promoted = ChangeRequest::cas_status(
            &self.pool,
            cr.id,
            CrState::PendingReview.as_str(),
            CrState::Approved.as_str(),
        )
        .await?;
        if !promoted {
            let current = ChangeRequest::find_by_id(&self.pool, cr.id)
                .await?
                .ok_or(AppError::NotFound)?;
            return Ok(ApproveOutcome {
                cr: current,
                message: "Merge already in progress.".to_string(),
                merged: None,
            });
        }

        let cr = ChangeRequest::find_by_id(&self.pool, cr.id)
            .await?
            .ok_or(AppError::NotFound)?;

        let applied = tokio::time::timeout(
            self.merge_timeout,
            self.merge.execute(&cr, dataset, actor.id, force),
        )
        .await
        .map_err(|_| AppError::MergeFailed("merge timed out".to_string()))??;

        let cr = ChangeRequest::find_by_id(&self.pool, cr.id)
            .await?
            .ok_or(AppError::NotFound)?;

        let mut recipients = cr.reviewers();
        recipients.push(cr.requester_user_id);
        self.notifier
            .notify_many(
                &recipients,
                Some(actor.id),
                &format!("Change request merged: {}", cr.title),
                serde_json::json!({
                    "change_request_id": cr.public_id,
                    "version": applied.version_after,
                }),
            )
            .await;

        Ok(ApproveOutcome {
            cr,
            message: format!("Merged at version {}.", applied.version_after),
            merged: Some(applied),
        })
    }

    /// Reject on behalf of one reviewer. The first rejection is terminal.
    pub async fn reject(
        &self,
        cr: ChangeRequest,
        dataset: &Dataset,
        actor: &User,
        reason: &str,
    ) -> AppResult<ChangeRequest> {
        let state = CrState::parse(&cr.status).ok_or(AppError::NotPending)?;
        reject_gate(state, cr.decision_for(actor.id))?;

        let cr = self
            .write_decision(&cr, actor.id, ReviewerDecision::Rejected)
            .await?;

        let next = next_state(CrState::PendingReview, CrEventKind::Reject)
            .ok_or(AppError::NotPending)?;
        let moved = ChangeRequest::cas_status(
            &self.pool,
            cr.id,
            CrState::PendingReview.as_str(),
            next.as_str(),
        )
        .await?;
        if !moved {
            return Err(AppError::StaleState);
        }

        CrEvent::record(&self.pool, cr.id, "rejected", Some(actor.id), reason).await?;
        if !reason.trim().is_empty() {
            CrComment::create(&self.pool, cr.id, actor.id, reason).await?;
        }

        self.staging.destroy(dataset, cr.id).await.ok();

        let cr = ChangeRequest::find_by_id(&self.pool, cr.id)
            .await?
            .ok_or(AppError::NotFound)?;

        self.notifier
            .notify(
                cr.requester_user_id,
                &format!("Change request rejected: {}", cr.title),
                serde_json::json!({ "change_request_id": cr.public_id, "reason": reason }),
            )
            .await;

        Ok(cr)
    }

    /// Withdraw a change request. Requester only.
    pub async fn withdraw(
        &self,
        cr: ChangeRequest,
        dataset: &Dataset,
        actor: &User,
    ) -> AppResult<ChangeRequest> {
        let state = CrState::parse(&cr.status).ok_or(AppError::NotPending)?;
        withdraw_gate(state, cr.requester_user_id == actor.id)?;

        let next = next_state(CrState::PendingReview, CrEventKind::Withdraw)
            .ok_or(AppError::NotPending)?;
        let moved = ChangeRequest::cas_status(
            &self.pool,
            cr.id,
            CrState::PendingReview.as_str(),
            next.as_str(),
        )
        .await?;
        if !moved {
            return Err(AppError::StaleState);
        }

        CrEvent::record(&self.pool, cr.id, "withdrawn", Some(actor.id), "Withdrawn").await?;
        self.staging.destroy(dataset, cr.id).await.ok();

        let cr = ChangeRequest::find_by_id(&self.pool, cr.id)
            .await?
            .ok_or(AppError::NotFound)?;

        self.notifier
            .notify_many(
                &cr.reviewers(),
                Some(actor.id),
                &format!("Change request withdrawn: {}", cr.title),
                serde_json::json!({ "change_request_id": cr.public_id }),
            )
            .await;

        Ok(cr)
    }

    /// Preview the staged change.
    pub async fn preview(
        &self,
        cr: &ChangeRequest,
        dataset: &Dataset,
        limit: usize,
        offset: usize,
    ) -> AppResult<StagingPreview> {
        let state = CrState::parse(&cr.status).ok_or(AppError::NotFound)?;
        if state.is_final() {
            return Err(AppError::NotFound);
        }
        self.staging.preview(dataset, cr.id, limit, offset).await
    }

    /// Write one reviewer's decision with optimistic concurrency.
    async fn write_decision(
        &self,
        cr: &ChangeRequest,
        reviewer: Uuid,
        decision: ReviewerDecision,
    ) -> AppResult<ChangeRequest> {
        let mut current = cr.clone();

        for _ in 0..REVIEWER_WRITE_RETRIES {
            let state = CrState::parse(&current.status).ok_or(AppError::NotPending)?;
            if state != CrState::PendingReview {
                return Err(AppError::NotPending);
            }

            let mut states = current.reviewer_states.0.clone();
            let Some(entry) = states.iter_mut().find(|s| s.user_id == reviewer) else {
                return Err(AppError::Forbidden);
            };
            entry.decision = decision;
            entry.decided_at = Some(Utc::now());

            match ChangeRequest::update_reviewer_states(
                &self.pool,
                current.id,
                &states,
                current.row_version,
            )
            .await?
            {
                Some(updated) => return Ok(updated),
                None => {
                    // Somebody else wrote first; re-read and retry.
                    current = ChangeRequest::find_by_id(&self.pool, current.id)
                        .await?
                        .ok_or(AppError::NotFound)?;
                }
            }
        }

        Err(AppError::StaleState)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SETTLED: &[CrState] = &[
        CrState::Merged,
        CrState::CleanupPending,
        CrState::Closed,
        CrState::Rejected,
        CrState::Withdrawn,
    ];

    #[test]
    fn first_approve_records_the_decision() {
        let gate = approve_gate(CrState::PendingReview, Some(ReviewerDecision::Pending)).unwrap();
        assert_eq!(gate, ApproveGate::Record);
    }

    #[test]
    fn repeat_approve_while_review_is_open_is_a_no_op() {
        let gate = approve_gate(CrState::PendingReview, Some(ReviewerDecision::Approved)).unwrap();
        assert_eq!(gate, ApproveGate::RepeatOpen);
    }

    #[test]
    fn repeat_approve_after_the_cr_settled_returns_current_state() {
        // A retried approve call whose first invocation already merged
        // (or otherwise settled) the CR must not error.
        for &state in SETTLED {
            let gate = approve_gate(state, Some(ReviewerDecision::Approved)).unwrap();
            assert_eq!(gate, ApproveGate::RepeatSettled, "state {state:?}");
        }
        // Mid-merge repeats behave the same way.
        for state in [CrState::Approved, CrState::Merging] {
            let gate = approve_gate(state, Some(ReviewerDecision::Approved)).unwrap();
            assert_eq!(gate, ApproveGate::RepeatSettled, "state {state:?}");
        }
    }

    #[test]
    fn approve_twice_reaches_the_same_gate_as_once() {
        // First call records the decision...
        assert_eq!(
            approve_gate(CrState::PendingReview, Some(ReviewerDecision::Pending)).unwrap(),
            ApproveGate::Record
        );
        // ...and every later call, whatever the CR did in between, is a
        // read-only repeat.
        for &state in SETTLED {
            assert!(matches!(
                approve_gate(state, Some(ReviewerDecision::Approved)),
                Ok(ApproveGate::RepeatSettled)
            ));
        }
        assert!(matches!(
            approve_gate(CrState::PendingReview, Some(ReviewerDecision::Approved)),
            Ok(ApproveGate::RepeatOpen)
        ));
    }

    #[test]
    fn approve_by_a_non_reviewer_is_forbidden() {
        assert!(matches!(
            approve_gate(CrState::PendingReview, None),
            Err(AppError::Forbidden)
        ));
        assert!(matches!(
            approve_gate(CrState::Merged, None),
            Err(AppError::Forbidden)
        ));
    }

    #[test]
    fn approve_after_another_reviewer_rejected_is_not_pending() {
        // This reviewer never decided; the CR was terminated by a
        // rejection elsewhere.
        assert!(matches!(
            approve_gate(CrState::Rejected, Some(ReviewerDecision::Pending)),
            Err(AppError::NotPending)
        ));
    }

    #[test]
    fn reject_requires_an_open_review_and_a_reviewer() {
        assert!(reject_gate(CrState::PendingReview, Some(ReviewerDecision::Pending)).is_ok());

        assert!(matches!(
            reject_gate(CrState::PendingReview, None),
            Err(AppError::Forbidden)
        ));
        for &state in SETTLED {
            assert!(matches!(
                reject_gate(state, Some(ReviewerDecision::Pending)),
                Err(AppError::NotPending)
            ));
        }
    }

    #[test]
    fn withdraw_is_requester_only_then_state_checked() {
        assert!(withdraw_gate(CrState::PendingReview, true).is_ok());

        // A non-requester is refused before the state is consulted.
        for state in [CrState::PendingReview, CrState::Merged, CrState::Rejected] {
            assert!(matches!(
                withdraw_gate(state, false),
                Err(AppError::NotOwnerOfChange)
            ));
        }

        for &state in SETTLED {
            assert!(matches!(
                withdraw_gate(state, true),
                Err(AppError::NotPending)
            ));
        }
    }
}
