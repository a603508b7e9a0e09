//! Audit recording and the merged dataset timeline.
//!
//! Catalog events are append-only rows; merge and restore additionally
//! persist JSON artifacts (diff, validation, metadata) under a stable key
//! derived from the change request id. List requests join the catalog
//! stream with the engine's operation history, dropping engine entries
//! the catalog already represents.
//!
//! The recorder never depends on the notifier: a dataset's audit trail is
//! written even when nobody can be notified about it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::fs;
use uuid::Uuid;

use crate::changes::diff::DiffSummary;
use crate::models::{AuditEvent, NewAuditEvent};
use crate::storage::TableOp;
use crate::validation::ValidationSummary;

/// Audit event kinds written by the pipeline.
pub mod kinds {
    pub const DATASET_CREATED: &str = "dataset.created";
    pub const CR_MERGED: &str = "cr.merged";
    pub const RESTORE: &str = "restore";
}

/// Artifact names under `<audit_root>/change_requests/<cr_id>/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Diff,
    Validation,
    Metadata,
}

impl ArtifactKind {
    fn filename(self) -> &'static str {
        match self {
            ArtifactKind::Diff => "diff.json",
            ArtifactKind::Validation => "validation.json",
            ArtifactKind::Metadata => "metadata.json",
        }
    }
}

/// One entry of the merged dataset timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// `catalog` for recorded audit events, `engine` for raw table ops.
    pub source: &'static str,
    pub kind: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_request_id: Option<Uuid>,
    pub rows_added: i64,
    pub rows_updated: i64,
    pub rows_deleted: i64,
}

/// One day of the snapshot calendar.
#[derive(Debug, Clone, Serialize)]
pub struct CalendarDay {
    pub date: String,
    pub versions: Vec<i64>,
    pub entries: usize,
}

/// Append-only audit recorder.
#[derive(Clone)]
pub struct AuditRecorder {
    pool: PgPool,
    audit_root: PathBuf,
}

impl AuditRecorder {
    pub fn new(pool: PgPool, audit_root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            audit_root: audit_root.into(),
        }
    }

    /// Append one catalog event.
    pub async fn record(&self, event: NewAuditEvent) -> Result<AuditEvent> {
        AuditEvent::append(&self.pool, event).await
    }

    fn artifact_dir(&self, cr_id: Uuid) -> PathBuf {
        self.audit_root.join("change_requests").join(cr_id.to_string())
    }

    /// Persist the merge artifacts for a change request.
    pub async fn write_merge_artifacts(
        &self,
        cr_id: Uuid,
        diff: &DiffSummary,
        validation: &ValidationSummary,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let dir = self.artifact_dir(cr_id);
        fs::create_dir_all(&dir)
            .await
            .context("failed to create audit artifact directory")?;

        write_artifact(&dir, ArtifactKind::Diff, diff).await?;
        write_artifact(&dir, ArtifactKind::Validation, validation).await?;
        write_artifact(&dir, ArtifactKind::Metadata, metadata).await?;

        Ok(())
    }

    /// Load one artifact, if it was written.
    pub async fn read_artifact(
        &self,
        cr_id: Uuid,
        kind: ArtifactKind,
    ) -> Result<Option<serde_json::Value>> {
        let path = self.artifact_dir(cr_id).join(kind.filename());
        match fs::read(&path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt audit artifact at {path:?}"))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read audit artifact"),
        }
    }

    /// The merged timeline for a dataset, newest first.
    pub async fn timeline(
        &self,
        dataset_id: Uuid,
        engine_ops: Vec<TableOp>,
        kind: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TimelineEntry>> {
        // Fetch enough catalog events to fill the page after the engine
        // stream is folded in, then slice.
        let events =
            AuditEvent::list_for_dataset(&self.pool, dataset_id, kind, limit + offset, 0).await?;

        let mut merged = merge_timeline(events, engine_ops);
        if let Some(kind) = kind {
            merged.retain(|e| e.kind == kind);
        }

        Ok(merged
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    /// Snapshot calendar: timeline entries grouped by UTC date.
    pub async fn calendar(
        &self,
        dataset_id: Uuid,
        engine_ops: Vec<TableOp>,
    ) -> Result<Vec<CalendarDay>> {
        let events = AuditEvent::list_for_dataset(&self.pool, dataset_id, None, 10_000, 0).await?;
        let merged = merge_timeline(events, engine_ops);
        Ok(build_calendar(&merged))
    }
}

async fn write_artifact<T: Serialize>(
    dir: &std::path::Path,
    kind: ArtifactKind,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("failed to serialize audit artifact")?;
    fs::write(dir.join(kind.filename()), bytes)
        .await
        .context("failed to write audit artifact")?;
    Ok(())
}

/// Fold catalog events and engine history into one stream.
///
/// Engine WRITE and RESTORE entries that the catalog already records as
/// `cr.merged` or `restore` (matched on the produced version) are
/// dropped. The result is ordered by (timestamp, id) descending.
pub fn merge_timeline(events: Vec<AuditEvent>, ops: Vec<TableOp>) -> Vec<TimelineEntry> {
    let recorded_versions: Vec<i64> = events
        .iter()
        .filter(|e| e.kind == kinds::CR_MERGED || e.kind == kinds::RESTORE)
        .filter_map(|e| e.snapshot_version)
        .collect();

    let mut entries: Vec<TimelineEntry> = events
        .into_iter()
        .map(|e| TimelineEntry {
            id: Some(e.id),
            source: "catalog",
            kind: e.kind,
            title: e.title,
            timestamp: e.created_at,
            version: e.snapshot_version,
            change_request_id: e.change_request_id,
            rows_added: e.rows_added,
            rows_updated: e.rows_updated,
            rows_deleted: e.rows_deleted,
        })
        .collect();

    for op in ops {
        if recorded_versions.contains(&op.version) {
            continue;
        }
        let kind = format!("engine.{}", op.op.to_lowercase());
        entries.push(TimelineEntry {
            id: None,
            source: "engine",
            title: match op.restored_from {
                Some(v) => format!("Version {} (restored from {v})", op.version),
                None => format!("Version {}", op.version),
            },
            kind,
            timestamp: op.timestamp,
            version: Some(op.version),
            change_request_id: None,
            rows_added: op.rows_added,
            rows_updated: op.rows_updated,
            rows_deleted: op.rows_deleted,
        });
    }

    entries.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    });

    entries
}

/// Group timeline entries by UTC date, newest date first.
pub fn build_calendar(entries: &[TimelineEntry]) -> Vec<CalendarDay> {
    let mut days: BTreeMap<String, (Vec<i64>, usize)> = BTreeMap::new();

    for entry in entries {
        let date = entry.timestamp.date_naive().to_string();
        let day = days.entry(date).or_default();
        if let Some(version) = entry.version
            && !day.0.contains(&version)
        {
            day.0.push(version);
        }
        day.1 += 1;
    }

    days.into_iter()
        .rev()
        .map(|(date, (mut versions, entries))| {
            versions.sort_unstable();
            CalendarDay {
                date,
                versions,
                entries,
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(kind: &str, version: Option<i64>, at: DateTime<Utc>) -> AuditEvent {
        AuditEvent {
            id: Uuid::now_v7(),
            project_id: Uuid::nil(),
            dataset_id: Uuid::nil(),
            kind: kind.to_string(),
            title: kind.to_string(),
            description: String::new(),
            actor_user_id: None,
            change_request_id: None,
            snapshot_version: version,
            rows_added: 0,
            rows_updated: 0,
            rows_deleted: 0,
            created_at: at,
        }
    }

    fn op(op_name: &str, version: i64, at: DateTime<Utc>) -> TableOp {
        TableOp {
            version,
            op: op_name.to_string(),
            timestamp: at,
            rows_added: 0,
            rows_updated: 0,
            rows_deleted: 0,
            restored_from: None,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn engine_entries_already_recorded_are_deduplicated() {
        let events = vec![event(kinds::CR_MERGED, Some(3), at(10))];
        let ops = vec![op("MERGE", 3, at(10)), op("WRITE", 2, at(8))];

        let merged = merge_timeline(events, ops);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].source, "catalog");
        assert_eq!(merged[1].source, "engine");
        assert_eq!(merged[1].version, Some(2));
    }

    #[test]
    fn timeline_is_newest_first() {
        let events = vec![
            event(kinds::RESTORE, Some(5), at(12)),
            event(kinds::CR_MERGED, Some(4), at(9)),
        ];
        let merged = merge_timeline(events, vec![op("WRITE", 1, at(11))]);

        let stamps: Vec<_> = merged.iter().map(|e| e.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(stamps, sorted);
    }

    #[test]
    fn calendar_groups_by_utc_date() {
        let d1 = Utc.with_ymd_and_hms(2026, 3, 14, 23, 0, 0).single().unwrap();
        let d2 = Utc.with_ymd_and_hms(2026, 3, 15, 1, 0, 0).single().unwrap();
        let merged = merge_timeline(
            vec![event(kinds::CR_MERGED, Some(1), d1), event(kinds::CR_MERGED, Some(2), d2)],
            Vec::new(),
        );

        let calendar = build_calendar(&merged);
        assert_eq!(calendar.len(), 2);
        assert_eq!(calendar[0].date, "2026-03-15");
        assert_eq!(calendar[0].versions, vec![2]);
        assert_eq!(calendar[1].date, "2026-03-14");
    }
}
