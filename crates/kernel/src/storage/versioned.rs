//! File-backed versioned table engine.
//!
//! Each table is a directory holding one JSON snapshot per version plus a
//! commit log. Versions are dense integers starting at 1; version 0 is
//! the implicit empty table. Reads accept any committed version, so time
//! travel and restore fall out of the layout.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/<table key>/
//!     _log.json        commit log, oldest first
//!     _columns.json    column names
//!     v000001.json     snapshot of version 1
//!     v000002.json     ...
//! <root>/<staging key>/rows.json
//! ```
//!
//! A merge records the staging source key in its commit entry; retrying
//! the same merge returns the recorded outcome instead of committing a
//! second version.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::{
    MergeOptions, MergeOutcome, Row, RowSet, StagedRow, StorageBackend, StorageError,
    StorageResult, TableOp, TableRef, TableStats, observed_columns, row_key,
};

const LOG_FILE: &str = "_log.json";
const COLUMNS_FILE: &str = "_columns.json";
const STAGING_FILE: &str = "rows.json";

/// One committed version in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Commit {
    version: i64,
    op: String,
    timestamp: chrono::DateTime<Utc>,
    rows_added: i64,
    rows_updated: i64,
    rows_deleted: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    restored_from: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

impl Commit {
    fn into_op(self) -> TableOp {
        TableOp {
            version: self.version,
            op: self.op,
            timestamp: self.timestamp,
            rows_added: self.rows_added,
            rows_updated: self.rows_updated,
            rows_deleted: self.rows_deleted,
            restored_from: self.restored_from,
        }
    }
}

/// Snapshot file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// File-backed versioned backend.
pub struct VersionedBackend {
    root: PathBuf,
    /// One writer at a time per table key.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VersionedBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    fn table_dir(&self, table: &TableRef) -> PathBuf {
        self.root.join(&table.key)
    }

    fn lock_for(&self, table: &TableRef) -> Arc<Mutex<()>> {
        self.locks
            .entry(table.key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn snapshot_path(dir: &Path, version: i64) -> PathBuf {
        dir.join(format!("v{version:06}.json"))
    }

    async fn read_log(&self, dir: &Path) -> StorageResult<Vec<Commit>> {
        let path = dir.join(LOG_FILE);
        match fs::read(&path).await {
            Ok(bytes) => {
                let log: Vec<Commit> = serde_json::from_slice(&bytes)
                    .map_err(|e| anyhow::anyhow!("corrupt table log at {path:?}: {e}"))?;
                Ok(log)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::TableNotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read_columns(&self, dir: &Path) -> StorageResult<Vec<String>> {
        let path = dir.join(COLUMNS_FILE);
        match fs::read(&path).await {
            Ok(bytes) => {
                let columns: Vec<String> = serde_json::from_slice(&bytes)
                    .map_err(|e| anyhow::anyhow!("corrupt column list at {path:?}: {e}"))?;
                Ok(columns)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_snapshot(&self, dir: &Path, version: i64) -> StorageResult<Snapshot> {
        if version == 0 {
            return Ok(Snapshot::default());
        }

        let path = Self::snapshot_path(dir, version);
        match fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)
                    .map_err(|e| anyhow::anyhow!("corrupt snapshot at {path:?}: {e}"))?;
                Ok(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::VersionNotFound(version))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Commit a new snapshot and its log entry.
    async fn commit(
        &self,
        dir: &Path,
        log: &mut Vec<Commit>,
        snapshot: &Snapshot,
        entry: Commit,
    ) -> StorageResult<()> {
        let version = entry.version;
        write_json(&Self::snapshot_path(dir, version), snapshot).await?;
        write_json(&dir.join(COLUMNS_FILE), &snapshot.columns).await?;
        log.push(entry);
        write_json(&dir.join(LOG_FILE), log).await?;
        Ok(())
    }

    async fn ensure_dir(&self, table: &TableRef) -> StorageResult<PathBuf> {
        let dir = self.table_dir(table);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

#[async_trait]
impl StorageBackend for VersionedBackend {
    async fn ensure(&self, table: &TableRef, columns: &[String]) -> StorageResult<()> {
        let lock = self.lock_for(table);
        let _guard = lock.lock().await;

        let dir = self.ensure_dir(table).await?;
        if self.read_log(&dir).await.is_err() {
            write_json(&dir.join(LOG_FILE), &Vec::<Commit>::new()).await?;
            write_json(&dir.join(COLUMNS_FILE), &columns.to_vec()).await?;
        }

        Ok(())
    }

    async fn append(
        &self,
        table: &TableRef,
        rows: &[Row],
        _primary_keys: &[String],
    ) -> StorageResult<i64> {
        let lock = self.lock_for(table);
        let _guard = lock.lock().await;

        let dir = self.ensure_dir(table).await?;
        let mut log = match self.read_log(&dir).await {
            Ok(log) => log,
            Err(StorageError::TableNotFound) => Vec::new(),
            Err(e) => return Err(e),
        };

        let current = log.last().map(|c| c.version).unwrap_or(0);
        let mut snapshot = self.read_snapshot(&dir, current).await?;

        snapshot.rows.extend(rows.iter().cloned());
        for column in observed_columns(rows) {
            if !snapshot.columns.contains(&column) {
                snapshot.columns.push(column);
            }
        }

        let version = current + 1;
        let entry = Commit {
            version,
            op: "WRITE".to_string(),
            timestamp: Utc::now(),
            rows_added: rows.len() as i64,
            rows_updated: 0,
            rows_deleted: 0,
            restored_from: None,
            source: None,
        };
        self.commit(&dir, &mut log, &snapshot, entry).await?;

        Ok(version)
    }

    async fn read(
        &self,
        table: &TableRef,
        at_version: Option<i64>,
        limit: usize,
        offset: usize,
    ) -> StorageResult<RowSet> {
        let dir = self.table_dir(table);
        let log = self.read_log(&dir).await?;
        let current = log.last().map(|c| c.version).unwrap_or(0);

        let version = match at_version {
            Some(v) if v < 0 || v > current => return Err(StorageError::VersionNotFound(v)),
            Some(v) => v,
            None => current,
        };

        let snapshot = self.read_snapshot(&dir, version).await?;
        let columns = if snapshot.columns.is_empty() {
            self.read_columns(&dir).await?
        } else {
            snapshot.columns
        };
        let total = snapshot.rows.len();
        let rows: Vec<Row> = snapshot.rows.into_iter().skip(offset).take(limit).collect();

        Ok(RowSet {
            columns,
            rows,
            total,
        })
    }

    async fn stats(&self, table: &TableRef) -> StorageResult<TableStats> {
        let dir = self.table_dir(table);
        let log = self.read_log(&dir).await?;
        let current = log.last().map(|c| c.version).unwrap_or(0);
        let snapshot = self.read_snapshot(&dir, current).await?;
        let column_count = if snapshot.columns.is_empty() {
            self.read_columns(&dir).await?.len()
        } else {
            snapshot.columns.len()
        };

        Ok(TableStats {
            row_count: snapshot.rows.len() as i64,
            column_count: column_count as i64,
            current_version: current,
        })
    }

    async fn merge(
        &self,
        table: &TableRef,
        staging: &TableRef,
        primary_keys: &[String],
        options: MergeOptions,
    ) -> StorageResult<MergeOutcome> {
        let lock = self.lock_for(table);
        let _guard = lock.lock().await;

        let dir = self.ensure_dir(table).await?;
        let mut log = match self.read_log(&dir).await {
            Ok(log) => log,
            Err(StorageError::TableNotFound) => Vec::new(),
            Err(e) => return Err(e),
        };

        // A retry of an already-committed merge returns the recorded
        // outcome instead of committing again.
        if let Some(last) = log.last()
            && last.op == "MERGE"
            && last.source.as_deref() == Some(staging.key.as_str())
        {
            return Ok(MergeOutcome {
                version_before: last.version - 1,
                version_after: last.version,
                rows_added: last.rows_added,
                rows_updated: last.rows_updated,
                rows_deleted: last.rows_deleted,
            });
        }

        let (staged, _) = self.read_staging(staging, usize::MAX, 0).await?;

        let current = log.last().map(|c| c.version).unwrap_or(0);
        let mut snapshot = self.read_snapshot(&dir, current).await?;

        let mut rows_added = 0i64;
        let mut rows_updated = 0i64;
        let mut rows_deleted = 0i64;

        for staged_row in &staged {
            if staged_row.deleted {
                if !options.apply_deletes {
                    continue;
                }
                let before = snapshot.rows.len();
                snapshot
                    .rows
                    .retain(|r| row_key(r, primary_keys) != staged_row.key);
                rows_deleted += (before - snapshot.rows.len()) as i64;
                continue;
            }

            match snapshot
                .rows
                .iter_mut()
                .find(|r| row_key(r, primary_keys) == staged_row.key)
            {
                Some(existing) => {
                    if *existing != staged_row.data {
                        *existing = staged_row.data.clone();
                        rows_updated += 1;
                    }
                }
                None => {
                    snapshot.rows.push(staged_row.data.clone());
                    rows_added += 1;
                }
            }
        }

        for column in observed_columns(
            &staged
                .iter()
                .filter(|s| !s.deleted)
                .map(|s| s.data.clone())
                .collect::<Vec<_>>(),
        ) {
            if !snapshot.columns.contains(&column) {
                snapshot.columns.push(column);
            }
        }

        let version = current + 1;
        let entry = Commit {
            version,
            op: "MERGE".to_string(),
            timestamp: Utc::now(),
            rows_added,
            rows_updated,
            rows_deleted,
            restored_from: None,
            source: Some(staging.key.clone()),
        };
        self.commit(&dir, &mut log, &snapshot, entry).await?;

        Ok(MergeOutcome {
            version_before: current,
            version_after: version,
            rows_added,
            rows_updated,
            rows_deleted,
        })
    }

    async fn history(&self, table: &TableRef) -> StorageResult<Vec<TableOp>> {
        let dir = self.table_dir(table);
        let log = self.read_log(&dir).await?;
        Ok(log.into_iter().map(Commit::into_op).collect())
    }

    async fn restore(&self, table: &TableRef, version: i64) -> StorageResult<TableOp> {
        let lock = self.lock_for(table);
        let _guard = lock.lock().await;

        let dir = self.table_dir(table);
        let mut log = self.read_log(&dir).await?;
        let current = log.last().map(|c| c.version).unwrap_or(0);

        if version < 0 || version > current {
            return Err(StorageError::VersionNotFound(version));
        }

        let snapshot = self.read_snapshot(&dir, version).await?;

        let new_version = current + 1;
        let entry = Commit {
            version: new_version,
            op: "RESTORE".to_string(),
            timestamp: Utc::now(),
            rows_added: 0,
            rows_updated: 0,
            rows_deleted: 0,
            restored_from: Some(version),
            source: None,
        };
        self.commit(&dir, &mut log, &snapshot, entry.clone()).await?;

        Ok(entry.into_op())
    }

    async fn write_staging(&self, staging: &TableRef, rows: &[StagedRow]) -> StorageResult<()> {
        let dir = self.ensure_dir(staging).await?;
        write_json(&dir.join(STAGING_FILE), &rows.to_vec()).await?;
        Ok(())
    }

    async fn read_staging(
        &self,
        staging: &TableRef,
        limit: usize,
        offset: usize,
    ) -> StorageResult<(Vec<StagedRow>, usize)> {
        let path = self.table_dir(staging).join(STAGING_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::TableNotFound);
            }
            Err(e) => return Err(e.into()),
        };

        let staged: Vec<StagedRow> = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("corrupt staging file at {path:?}: {e}"))?;
        let total = staged.len();
        let page: Vec<StagedRow> = staged.into_iter().skip(offset).take(limit).collect();

        Ok((page, total))
    }

    async fn destroy_staging(&self, staging: &TableRef) -> StorageResult<()> {
        let dir = self.table_dir(staging);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serialize to a temp file, then rename into place.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| anyhow::anyhow!("serialize: {e}"))?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
