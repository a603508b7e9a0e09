//! Audit event model.
//!
//! Inserts only. The schema backs this up with a trigger that rejects
//! UPDATE and DELETE, so no mutating functions exist here.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

/// Audit event record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: Uuid,
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub kind: String,
    pub title: String,
    pub description: String,
    pub actor_user_id: Option<Uuid>,
    pub change_request_id: Option<Uuid>,
    pub snapshot_version: Option<i64>,
    pub rows_added: i64,
    pub rows_updated: i64,
    pub rows_deleted: i64,
    pub created_at: DateTime<Utc>,
}

/// Input for appending an audit event.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub kind: String,
    pub title: String,
    pub description: String,
    pub actor_user_id: Option<Uuid>,
    pub change_request_id: Option<Uuid>,
    pub snapshot_version: Option<i64>,
    pub rows_added: i64,
    pub rows_updated: i64,
    pub rows_deleted: i64,
}

impl AuditEvent {
    /// Append an event.
    pub async fn append(pool: &PgPool, input: NewAuditEvent) -> Result<Self> {
        let event = sqlx::query_as::<_, AuditEvent>(
            r#"
            INSERT INTO audit_events
                (id, project_id, dataset_id, kind, title, description, actor_user_id,
                 change_request_id, snapshot_version, rows_added, rows_updated, rows_deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.project_id)
        .bind(input.dataset_id)
        .bind(&input.kind)
        .bind(&input.title)
        .bind(&input.description)
        .bind(input.actor_user_id)
        .bind(input.change_request_id)
        .bind(input.snapshot_version)
        .bind(input.rows_added)
        .bind(input.rows_updated)
        .bind(input.rows_deleted)
        .fetch_one(pool)
        .await
        .context("failed to append audit event")?;

        Ok(event)
    }

    /// Find an audit event by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let event = sqlx::query_as::<_, AuditEvent>("SELECT * FROM audit_events WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch audit event")?;

        Ok(event)
    }

    /// Events for a dataset, newest first.
    pub async fn list_for_dataset(
        pool: &PgPool,
        dataset_id: Uuid,
        kind: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>> {
        let events = match kind {
            Some(kind) => {
                sqlx::query_as::<_, AuditEvent>(
                    r#"
                    SELECT * FROM audit_events
                    WHERE dataset_id = $1 AND kind = $2
                    ORDER BY created_at DESC, id DESC
                    LIMIT $3 OFFSET $4
                    "#,
                )
                .bind(dataset_id)
                .bind(kind)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, AuditEvent>(
                    r#"
                    SELECT * FROM audit_events
                    WHERE dataset_id = $1
                    ORDER BY created_at DESC, id DESC
                    LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(dataset_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(pool)
                .await
            }
        }
        .context("failed to list audit events")?;

        Ok(events)
    }
}
