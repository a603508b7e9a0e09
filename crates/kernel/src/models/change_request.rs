//! Change request, CR event, and CR comment models.
//!
//! The change request row is the single source of truth for pipeline
//! state. Reviewer states are stored as their canonical JSON serialization
//! and accessed in memory as typed records. Concurrent reviewer updates
//! are serialized with an optimistic row-version column; status moves that
//! must be exclusive (merge) go through a compare-and-swap on `status`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::ids;

/// Kind of proposed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrKind {
    Append,
    LiveEdit,
}

impl CrKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CrKind::Append => "append",
            CrKind::LiveEdit => "live_edit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "append" => Some(CrKind::Append),
            "live_edit" => Some(CrKind::LiveEdit),
            _ => None,
        }
    }
}

/// Per-reviewer decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerDecision {
    Pending,
    Approved,
    Rejected,
}

/// One reviewer's state on a change request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerState {
    pub user_id: Uuid,
    pub decision: ReviewerDecision,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ReviewerState {
    pub fn pending(user_id: Uuid) -> Self {
        Self {
            user_id,
            decision: ReviewerDecision::Pending,
            decided_at: None,
        }
    }
}

/// A single edited cell in a live-edit change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditedCell {
    pub row_key: String,
    pub column: String,
    pub value: serde_json::Value,
}

/// The payload of a live-edit change request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditSet {
    /// Client-generated opaque session token.
    pub session_id: Option<String>,
    pub cells: Vec<EditedCell>,
    #[serde(default)]
    pub deleted_rows: Vec<String>,
}

/// Change request record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChangeRequest {
    pub id: Uuid,
    pub public_id: String,
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub kind: String,
    pub status: String,
    pub title: String,
    pub requester_user_id: Uuid,
    pub reviewer_states: Json<Vec<ReviewerState>>,
    pub upload_id: Option<Uuid>,
    pub edit_set: Option<Json<EditSet>>,
    pub summary: Option<String>,
    pub version_before: Option<i64>,
    pub version_after: Option<i64>,
    pub row_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a change request.
#[derive(Debug)]
pub struct NewChangeRequest {
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub kind: CrKind,
    pub status: String,
    pub title: String,
    pub requester_user_id: Uuid,
    pub reviewers: Vec<Uuid>,
    pub upload_id: Option<Uuid>,
    pub edit_set: Option<EditSet>,
    pub version_before: Option<i64>,
}

impl ChangeRequest {
    /// The reviewer set, derived from the reviewer states.
    pub fn reviewers(&self) -> Vec<Uuid> {
        self.reviewer_states.0.iter().map(|r| r.user_id).collect()
    }

    /// The recorded decision of one reviewer, if they are a reviewer.
    pub fn decision_for(&self, user_id: Uuid) -> Option<ReviewerDecision> {
        self.reviewer_states
            .0
            .iter()
            .find(|r| r.user_id == user_id)
            .map(|r| r.decision)
    }

    /// Whether every reviewer has approved.
    pub fn quorum_satisfied(&self) -> bool {
        !self.reviewer_states.0.is_empty()
            && self
                .reviewer_states
                .0
                .iter()
                .all(|r| r.decision == ReviewerDecision::Approved)
    }

    /// Create a change request with all reviewers pending.
    pub async fn create(pool: &PgPool, input: NewChangeRequest) -> Result<Self> {
        let id = Uuid::now_v7();
        let public_id = ids::public_id();
        let states: Vec<ReviewerState> = input
            .reviewers
            .iter()
            .map(|&u| ReviewerState::pending(u))
            .collect();

        let cr = sqlx::query_as::<_, ChangeRequest>(
            r#"
            INSERT INTO change_requests
                (id, public_id, project_id, dataset_id, kind, status, title,
                 requester_user_id, reviewer_states, upload_id, edit_set, version_before)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&public_id)
        .bind(input.project_id)
        .bind(input.dataset_id)
        .bind(input.kind.as_str())
        .bind(&input.status)
        .bind(&input.title)
        .bind(input.requester_user_id)
        .bind(Json(&states))
        .bind(input.upload_id)
        .bind(input.edit_set.as_ref().map(Json))
        .bind(input.version_before)
        .fetch_one(pool)
        .await
        .context("failed to create change request")?;

        Ok(cr)
    }

    /// Find a change request by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let cr = sqlx::query_as::<_, ChangeRequest>(
            "SELECT * FROM change_requests WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch change request")?;

        Ok(cr)
    }

    /// Resolve from an external key (UUID or public id).
    pub async fn resolve(pool: &PgPool, key: &str) -> Result<Option<Self>> {
        if let Some(id) = ids::as_uuid(key) {
            return Self::find_by_id(pool, id).await;
        }

        let cr = sqlx::query_as::<_, ChangeRequest>(
            "SELECT * FROM change_requests WHERE public_id = $1",
        )
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("failed to fetch change request by public id")?;

        Ok(cr)
    }

    /// List change requests in a project, optionally filtered by status.
    pub async fn list_for_project(
        pool: &PgPool,
        project_id: Uuid,
        status: Option<&str>,
    ) -> Result<Vec<Self>> {
        let crs = match status {
            Some(status) => {
                sqlx::query_as::<_, ChangeRequest>(
                    r#"
                    SELECT * FROM change_requests
                    WHERE project_id = $1 AND status = $2
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(project_id)
                .bind(status)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, ChangeRequest>(
                    "SELECT * FROM change_requests WHERE project_id = $1 ORDER BY created_at DESC",
                )
                .bind(project_id)
                .fetch_all(pool)
                .await
            }
        }
        .context("failed to list change requests")?;

        Ok(crs)
    }

    /// List all change requests currently in the given status.
    pub async fn list_with_status(pool: &PgPool, status: &str) -> Result<Vec<Self>> {
        let crs = sqlx::query_as::<_, ChangeRequest>(
            "SELECT * FROM change_requests WHERE status = $1 ORDER BY updated_at",
        )
        .bind(status)
        .fetch_all(pool)
        .await
        .context("failed to list change requests by status")?;

        Ok(crs)
    }

    /// Replace the reviewer states if nobody else wrote the row first.
    ///
    /// Returns the updated row on success, or None when the row version
    /// moved underneath the caller (retry with a fresh read).
    pub async fn update_reviewer_states(
        pool: &PgPool,
        id: Uuid,
        states: &[ReviewerState],
        expected_row_version: i64,
    ) -> Result<Option<Self>> {
        let cr = sqlx::query_as::<_, ChangeRequest>(
            r#"
            UPDATE change_requests
            SET reviewer_states = $2, row_version = row_version + 1, updated_at = NOW()
            WHERE id = $1 AND row_version = $3
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Json(states))
        .bind(expected_row_version)
        .fetch_optional(pool)
        .await
        .context("failed to update reviewer states")?;

        Ok(cr)
    }

    /// Compare-and-swap the status. Returns false when the current status
    /// did not match `from` (somebody else transitioned first).
    pub async fn cas_status(pool: &PgPool, id: Uuid, from: &str, to: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE change_requests
            SET status = $3, row_version = row_version + 1, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(pool)
        .await
        .context("failed to CAS change request status")?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the merge outcome on the row.
    pub async fn record_merge(
        pool: &PgPool,
        id: Uuid,
        version_before: i64,
        version_after: i64,
        summary: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE change_requests
            SET version_before = $2, version_after = $3, summary = $4,
                row_version = row_version + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(version_before)
        .bind(version_after)
        .bind(summary)
        .execute(pool)
        .await
        .context("failed to record merge outcome")?;

        Ok(())
    }
}

/// Lifecycle event on a change request.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrEvent {
    pub id: Uuid,
    pub cr_id: Uuid,
    pub kind: String,
    pub actor_user_id: Option<Uuid>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl CrEvent {
    /// Append an event to a change request's history.
    pub async fn record(
        pool: &PgPool,
        cr_id: Uuid,
        kind: &str,
        actor_user_id: Option<Uuid>,
        message: &str,
    ) -> Result<Self> {
        let event = sqlx::query_as::<_, CrEvent>(
            r#"
            INSERT INTO cr_events (id, cr_id, kind, actor_user_id, message)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(cr_id)
        .bind(kind)
        .bind(actor_user_id)
        .bind(message)
        .fetch_one(pool)
        .await
        .context("failed to record change request event")?;

        Ok(event)
    }

    /// Events for a change request, oldest first.
    pub async fn list_for_cr(pool: &PgPool, cr_id: Uuid) -> Result<Vec<Self>> {
        let events = sqlx::query_as::<_, CrEvent>(
            "SELECT * FROM cr_events WHERE cr_id = $1 ORDER BY created_at",
        )
        .bind(cr_id)
        .fetch_all(pool)
        .await
        .context("failed to list change request events")?;

        Ok(events)
    }
}

/// Discussion comment on a change request.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CrComment {
    pub id: Uuid,
    pub cr_id: Uuid,
    pub author_user_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl CrComment {
    /// Add a comment.
    pub async fn create(
        pool: &PgPool,
        cr_id: Uuid,
        author_user_id: Uuid,
        body: &str,
    ) -> Result<Self> {
        let comment = sqlx::query_as::<_, CrComment>(
            r#"
            INSERT INTO cr_comments (id, cr_id, author_user_id, body)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(cr_id)
        .bind(author_user_id)
        .bind(body)
        .fetch_one(pool)
        .await
        .context("failed to create comment")?;

        Ok(comment)
    }

    /// Comments for a change request, oldest first.
    pub async fn list_for_cr(pool: &PgPool, cr_id: Uuid) -> Result<Vec<Self>> {
        let comments = sqlx::query_as::<_, CrComment>(
            "SELECT * FROM cr_comments WHERE cr_id = $1 ORDER BY created_at",
        )
        .bind(cr_id)
        .fetch_all(pool)
        .await
        .context("failed to list comments")?;

        Ok(comments)
    }
}
