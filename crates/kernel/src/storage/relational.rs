//! Relational storage backend.
//!
//! Rows live in shared Postgres tables keyed by the derived table
//! location string. There is no version history: the version counter in
//! `table_meta` only advances so the merge pipeline can detect concurrent
//! writes, and time travel or restore requests are refused.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;

use super::{
    MergeOptions, MergeOutcome, Row, RowSet, StagedRow, StorageBackend, StorageError,
    StorageResult, TableOp, TableRef, TableStats, observed_columns, row_key,
};

/// Merge outcome persisted on `table_meta` so a retried merge of the same
/// staging source returns the recorded result instead of re-applying.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredOutcome {
    version_before: i64,
    version_after: i64,
    rows_added: i64,
    rows_updated: i64,
    rows_deleted: i64,
}

/// Postgres row store behind the [`StorageBackend`] contract.
pub struct RelationalBackend {
    pool: PgPool,
}

impl RelationalBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn meta(
        &self,
        table: &TableRef,
    ) -> StorageResult<Option<(Vec<String>, i64, chrono::DateTime<chrono::Utc>)>> {
        let row: Option<(Json<Vec<String>>, i64, chrono::DateTime<chrono::Utc>)> =
            sqlx::query_as(
                "SELECT column_names, current_version, updated_at FROM table_meta WHERE table_key = $1",
            )
            .bind(&table.key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(columns, version, updated_at)| (columns.0, version, updated_at)))
    }
}

#[async_trait]
impl StorageBackend for RelationalBackend {
    async fn ensure(&self, table: &TableRef, columns: &[String]) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO table_meta (table_key, column_names)
            VALUES ($1, $2)
            ON CONFLICT (table_key) DO NOTHING
            "#,
        )
        .bind(&table.key)
        .bind(Json(columns.to_vec()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append(
        &self,
        table: &TableRef,
        rows: &[Row],
        primary_keys: &[String],
    ) -> StorageResult<i64> {
        let Some((mut columns, version, _)) = self.meta(table).await? else {
            return Err(StorageError::TableNotFound);
        };

        let mut tx = self.pool.begin().await?;

        for row in rows {
            // Appends key rows the same way merges do, so a later merge
            // upserts against them deterministically.
            let key = row_key(row, primary_keys);
            sqlx::query(
                r#"
                INSERT INTO table_rows (table_key, row_key, data)
                VALUES ($1, $2, $3)
                ON CONFLICT (table_key, row_key) DO UPDATE SET data = EXCLUDED.data
                "#,
            )
            .bind(&table.key)
            .bind(&key)
            .bind(Json(row))
            .execute(&mut *tx)
            .await?;
        }

        for column in observed_columns(rows) {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }

        let new_version = version + 1;
        sqlx::query(
            r#"
            UPDATE table_meta
            SET current_version = $2, column_names = $3, updated_at = NOW()
            WHERE table_key = $1
            "#,
        )
        .bind(&table.key)
        .bind(new_version)
        .bind(Json(&columns))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(new_version)
    }

    async fn read(
        &self,
        table: &TableRef,
        at_version: Option<i64>,
        limit: usize,
        offset: usize,
    ) -> StorageResult<RowSet> {
        let Some((columns, version, _)) = self.meta(table).await? else {
            return Err(StorageError::TableNotFound);
        };

        if let Some(v) = at_version
            && v != version
        {
            return Err(StorageError::Unsupported(
                "time travel requires the versioned backend".to_string(),
            ));
        }

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM table_rows WHERE table_key = $1")
                .bind(&table.key)
                .fetch_one(&self.pool)
                .await?;

        let rows: Vec<(Json<Row>,)> = sqlx::query_as(
            r#"
            SELECT data FROM table_rows
            WHERE table_key = $1
            ORDER BY row_key
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&table.key)
        .bind(limit.min(i64::MAX as usize) as i64)
        .bind(offset.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(RowSet {
            columns,
            rows: rows.into_iter().map(|(r,)| r.0).collect(),
            total: total as usize,
        })
    }

    async fn stats(&self, table: &TableRef) -> StorageResult<TableStats> {
        let Some((columns, version, _)) = self.meta(table).await? else {
            return Err(StorageError::TableNotFound);
        };

        let row_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM table_rows WHERE table_key = $1")
                .bind(&table.key)
                .fetch_one(&self.pool)
                .await?;

        Ok(TableStats {
            row_count,
            column_count: columns.len() as i64,
            current_version: version,
        })
    }

    async fn merge(
        &self,
        table: &TableRef,
        staging: &TableRef,
        primary_keys: &[String],
        options: MergeOptions,
    ) -> StorageResult<MergeOutcome> {
        let Some((mut columns, version, _)) = self.meta(table).await? else {
            return Err(StorageError::TableNotFound);
        };

        // Retry of an already-applied merge returns the recorded outcome.
        let stored: Option<(Option<String>, Option<Json<StoredOutcome>>)> = sqlx::query_as(
            "SELECT last_merge_source, last_merge_outcome FROM table_meta WHERE table_key = $1",
        )
        .bind(&table.key)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((Some(source), Some(outcome))) = stored
            && source == staging.key
        {
            let o = outcome.0;
            return Ok(MergeOutcome {
                version_before: o.version_before,
                version_after: o.version_after,
                rows_added: o.rows_added,
                rows_updated: o.rows_updated,
                rows_deleted: o.rows_deleted,
            });
        }

        let (staged, _) = self.read_staging(staging, usize::MAX, 0).await?;

        let mut tx = self.pool.begin().await?;

        let mut rows_added = 0i64;
        let mut rows_updated = 0i64;
        let mut rows_deleted = 0i64;

        for staged_row in &staged {
            let key = if staged_row.deleted {
                staged_row.key.clone()
            } else {
                row_key(&staged_row.data, primary_keys)
            };

            if staged_row.deleted {
                if !options.apply_deletes {
                    continue;
                }
                let result = sqlx::query(
                    "DELETE FROM table_rows WHERE table_key = $1 AND row_key = $2",
                )
                .bind(&table.key)
                .bind(&key)
                .execute(&mut *tx)
                .await?;
                rows_deleted += result.rows_affected() as i64;
                continue;
            }

            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM table_rows WHERE table_key = $1 AND row_key = $2)",
            )
            .bind(&table.key)
            .bind(&key)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO table_rows (table_key, row_key, data)
                VALUES ($1, $2, $3)
                ON CONFLICT (table_key, row_key) DO UPDATE SET data = EXCLUDED.data
                "#,
            )
            .bind(&table.key)
            .bind(&key)
            .bind(Json(&staged_row.data))
            .execute(&mut *tx)
            .await?;

            if exists {
                rows_updated += 1;
            } else {
                rows_added += 1;
            }
        }

        let staged_rows: Vec<Row> = staged
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.data.clone())
            .collect();
        for column in observed_columns(&staged_rows) {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }

        let new_version = version + 1;
        let outcome = MergeOutcome {
            version_before: version,
            version_after: new_version,
            rows_added,
            rows_updated,
            rows_deleted,
        };

        sqlx::query(
            r#"
            UPDATE table_meta
            SET current_version = $2, column_names = $3,
                last_merge_source = $4, last_merge_outcome = $5, updated_at = NOW()
            WHERE table_key = $1
            "#,
        )
        .bind(&table.key)
        .bind(new_version)
        .bind(Json(&columns))
        .bind(&staging.key)
        .bind(Json(StoredOutcome {
            version_before: outcome.version_before,
            version_after: outcome.version_after,
            rows_added,
            rows_updated,
            rows_deleted,
        }))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(outcome)
    }

    async fn history(&self, table: &TableRef) -> StorageResult<Vec<TableOp>> {
        let Some((_, version, updated_at)) = self.meta(table).await? else {
            return Err(StorageError::TableNotFound);
        };

        if version == 0 {
            return Ok(Vec::new());
        }

        // No per-commit log on this backend: expose the current state as
        // a single synthetic entry.
        Ok(vec![TableOp {
            version,
            op: "WRITE".to_string(),
            timestamp: updated_at,
            rows_added: 0,
            rows_updated: 0,
            rows_deleted: 0,
            restored_from: None,
        }])
    }

    async fn restore(&self, _table: &TableRef, _version: i64) -> StorageResult<TableOp> {
        Err(StorageError::Unsupported(
            "restore requires the versioned backend".to_string(),
        ))
    }

    async fn write_staging(&self, staging: &TableRef, rows: &[StagedRow]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM staging_rows WHERE table_key = $1")
            .bind(&staging.key)
            .execute(&mut *tx)
            .await?;

        for (i, staged) in rows.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO staging_rows (table_key, row_key, data, deleted, seq)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (table_key, row_key)
                    DO UPDATE SET data = EXCLUDED.data, deleted = EXCLUDED.deleted
                "#,
            )
            .bind(&staging.key)
            .bind(&staged.key)
            .bind(Json(&staged.data))
            .bind(staged.deleted)
            .bind(i as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    async fn read_staging(
        &self,
        staging: &TableRef,
        limit: usize,
        offset: usize,
    ) -> StorageResult<(Vec<StagedRow>, usize)> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM staging_rows WHERE table_key = $1")
                .bind(&staging.key)
                .fetch_one(&self.pool)
                .await?;

        if total == 0 {
            return Err(StorageError::TableNotFound);
        }

        let rows: Vec<(String, Json<Row>, bool)> = sqlx::query_as(
            r#"
            SELECT row_key, data, deleted FROM staging_rows
            WHERE table_key = $1
            ORDER BY seq
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(&staging.key)
        .bind(limit.min(i64::MAX as usize) as i64)
        .bind(offset.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        let staged = rows
            .into_iter()
            .map(|(key, data, deleted)| StagedRow {
                key,
                data: data.0,
                deleted,
            })
            .collect();

        Ok((staged, total as usize))
    }

    async fn destroy_staging(&self, staging: &TableRef) -> StorageResult<()> {
        sqlx::query("DELETE FROM staging_rows WHERE table_key = $1")
            .bind(&staging.key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
