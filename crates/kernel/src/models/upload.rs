//! Upload model.
//!
//! Uploaded file bytes are immutable once stored and are retained while
//! any non-terminal change request references them.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

/// Maximum accepted upload size: 100 MiB.
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Upload record. `content` is loaded only by [`Upload::content`].
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Upload {
    pub id: Uuid,
    pub project_id: Uuid,
    pub dataset_id: Uuid,
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

impl Upload {
    /// Store uploaded bytes. The caller has already enforced the size cap.
    pub async fn create(
        pool: &PgPool,
        project_id: Uuid,
        dataset_id: Uuid,
        filename: &str,
        content: &[u8],
    ) -> Result<Self> {
        let id = Uuid::now_v7();

        let upload = sqlx::query_as::<_, Upload>(
            r#"
            INSERT INTO uploads (id, project_id, dataset_id, filename, content)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, project_id, dataset_id, filename, created_at
            "#,
        )
        .bind(id)
        .bind(project_id)
        .bind(dataset_id)
        .bind(filename)
        .bind(content)
        .fetch_one(pool)
        .await
        .context("failed to store upload")?;

        Ok(upload)
    }

    /// Find an upload by ID (without content).
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let upload = sqlx::query_as::<_, Upload>(
            "SELECT id, project_id, dataset_id, filename, created_at FROM uploads WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch upload")?;

        Ok(upload)
    }

    /// Load the stored bytes.
    pub async fn content(pool: &PgPool, id: Uuid) -> Result<Option<Vec<u8>>> {
        let content: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT content FROM uploads WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("failed to load upload content")?;

        Ok(content)
    }

    /// Whether any non-terminal change request still references this upload.
    pub async fn is_referenced(pool: &PgPool, id: Uuid) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM change_requests
            WHERE upload_id = $1
              AND status NOT IN ('merged', 'rejected', 'withdrawn', 'closed')
            "#,
        )
        .bind(id)
        .fetch_one(pool)
        .await
        .context("failed to count upload references")?;

        Ok(count > 0)
    }

    /// Delete an upload. Refused while still referenced.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool> {
        if Self::is_referenced(pool, id).await? {
            anyhow::bail!("upload is referenced by an open change request");
        }

        let result = sqlx::query("DELETE FROM uploads WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to delete upload")?;

        Ok(result.rows_affected() > 0)
    }
}
