//! Dataset and dataset metadata models.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::ids;
use crate::storage::TableSchema;
use crate::validation::RuleSet;

/// Storage backend a dataset lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Versioned,
    Relational,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Versioned => "versioned",
            StorageKind::Relational => "relational",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "versioned" => Some(StorageKind::Versioned),
            "relational" => Some(StorageKind::Relational),
            _ => None,
        }
    }
}

/// Dataset record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Dataset {
    pub id: Uuid,
    pub public_id: String,
    pub project_id: Uuid,
    pub name: String,
    pub storage_backend: String,
    pub table_schema: Option<Json<TableSchema>>,
    pub rules: Option<Json<RuleSet>>,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a dataset.
#[derive(Debug, Deserialize)]
pub struct CreateDataset {
    pub name: String,
    pub storage_backend: Option<StorageKind>,
    pub schema: Option<TableSchema>,
    pub rules: Option<RuleSet>,
}

/// Live metadata maintained by the merge executor and restore path.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DatasetMeta {
    pub dataset_id: Uuid,
    pub row_count: i64,
    pub column_count: i32,
    pub last_update_at: Option<DateTime<Utc>>,
    pub table_location: String,
    pub current_version: i64,
}

impl Dataset {
    /// Backend this dataset is stored on.
    pub fn storage_kind(&self) -> StorageKind {
        StorageKind::parse(&self.storage_backend).unwrap_or(StorageKind::Versioned)
    }

    /// Primary key columns, defaulting to a single `id` column.
    pub fn primary_keys(&self) -> Vec<String> {
        self.table_schema
            .as_ref()
            .map(|s| s.0.primary_keys())
            .unwrap_or_else(|| vec!["id".to_string()])
    }

    /// Create a dataset and its metadata row. The table location is
    /// derived from the identifiers, never stored anywhere else first.
    pub async fn create(
        pool: &PgPool,
        project_id: Uuid,
        input: CreateDataset,
        backend: StorageKind,
    ) -> Result<Self> {
        let id = Uuid::now_v7();
        let public_id = ids::public_id();
        let table_location = crate::storage::TableRef::main(project_id, id).key;
        let column_count = input
            .schema
            .as_ref()
            .map(|s| s.columns.len() as i32)
            .unwrap_or(0);

        let mut tx = pool.begin().await.context("failed to begin transaction")?;

        let dataset = sqlx::query_as::<_, Dataset>(
            r#"
            INSERT INTO datasets (id, public_id, project_id, name, storage_backend, table_schema, rules)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&public_id)
        .bind(project_id)
        .bind(&input.name)
        .bind(backend.as_str())
        .bind(input.schema.as_ref().map(Json))
        .bind(input.rules.as_ref().map(Json))
        .fetch_one(&mut *tx)
        .await
        .context("failed to create dataset")?;

        sqlx::query(
            r#"
            INSERT INTO dataset_meta (dataset_id, column_count, table_location)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id)
        .bind(column_count)
        .bind(&table_location)
        .execute(&mut *tx)
        .await
        .context("failed to create dataset metadata")?;

        tx.commit().await.context("failed to commit dataset")?;

        Ok(dataset)
    }

    /// Find a dataset by ID.
    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>> {
        let dataset = sqlx::query_as::<_, Dataset>("SELECT * FROM datasets WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch dataset by id")?;

        Ok(dataset)
    }

    /// Resolve a dataset from an external key (UUID or public id).
    pub async fn resolve(pool: &PgPool, key: &str) -> Result<Option<Self>> {
        if let Some(id) = ids::as_uuid(key) {
            return Self::find_by_id(pool, id).await;
        }

        let dataset = sqlx::query_as::<_, Dataset>("SELECT * FROM datasets WHERE public_id = $1")
            .bind(key)
            .fetch_optional(pool)
            .await
            .context("failed to fetch dataset by public id")?;

        Ok(dataset)
    }

    /// List datasets in a project.
    pub async fn list_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Self>> {
        let datasets = sqlx::query_as::<_, Dataset>(
            "SELECT * FROM datasets WHERE project_id = $1 ORDER BY name",
        )
        .bind(project_id)
        .fetch_all(pool)
        .await
        .context("failed to list datasets")?;

        Ok(datasets)
    }

    /// Whether the project already has a dataset with this name.
    pub async fn name_taken(pool: &PgPool, project_id: Uuid, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM datasets WHERE project_id = $1 AND name = $2",
        )
        .bind(project_id)
        .bind(name)
        .fetch_one(pool)
        .await
        .context("failed to check dataset name")?;

        Ok(count > 0)
    }

    /// Delete a dataset. Cascades to metadata, uploads, and change requests.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM datasets WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await
            .context("failed to delete dataset")?;

        Ok(result.rows_affected() > 0)
    }
}

impl DatasetMeta {
    /// Fetch metadata for a dataset.
    pub async fn find(pool: &PgPool, dataset_id: Uuid) -> Result<Option<Self>> {
        let meta = sqlx::query_as::<_, DatasetMeta>(
            "SELECT * FROM dataset_meta WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch dataset metadata")?;

        Ok(meta)
    }

    /// Atomically record the state after a merge or restore.
    pub async fn record_update(
        pool: &PgPool,
        dataset_id: Uuid,
        current_version: i64,
        row_count: i64,
        column_count: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dataset_meta
            SET current_version = $2, row_count = $3, column_count = $4, last_update_at = NOW()
            WHERE dataset_id = $1
            "#,
        )
        .bind(dataset_id)
        .bind(current_version)
        .bind(row_count)
        .bind(column_count)
        .execute(pool)
        .await
        .context("failed to update dataset metadata")?;

        Ok(())
    }
}
