//! Pre-image vs projected-image diffing.
//!
//! The merge executor validates and summarizes against the projected
//! post-merge image before the backend commits anything, so the diff and
//! the commit always describe the same change.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::storage::{Row, StagedRow, row_key};

/// Summary of what a merge changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub rows_added: i64,
    pub rows_updated: i64,
    pub rows_deleted: i64,
    pub cells_changed: i64,
}

/// Compute the post-merge image of a table.
pub fn projected_image(
    pre: &[Row],
    staged: &[StagedRow],
    primary_keys: &[String],
    apply_deletes: bool,
) -> Vec<Row> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, Row> = HashMap::new();

    for row in pre {
        let key = row_key(row, primary_keys);
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, row.clone());
    }

    for entry in staged {
        if entry.deleted {
            if apply_deletes && by_key.remove(&entry.key).is_some() {
                order.retain(|k| k != &entry.key);
            }
            continue;
        }
        let key = row_key(&entry.data, primary_keys);
        if !by_key.contains_key(&key) {
            order.push(key.clone());
        }
        by_key.insert(key, entry.data.clone());
    }

    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Diff the pre-image against the staged change by primary key.
pub fn compute_diff(
    pre: &[Row],
    staged: &[StagedRow],
    primary_keys: &[String],
    apply_deletes: bool,
) -> DiffSummary {
    let pre_by_key: HashMap<String, &Row> = pre
        .iter()
        .map(|row| (row_key(row, primary_keys), row))
        .collect();

    let mut summary = DiffSummary::default();
    let mut seen: Vec<&str> = Vec::new();

    for entry in staged {
        if entry.deleted {
            if apply_deletes && let Some(old) = pre_by_key.get(entry.key.as_str()) {
                summary.rows_deleted += 1;
                summary.cells_changed += old.len() as i64;
            }
            continue;
        }

        let key = row_key(&entry.data, primary_keys);
        if seen.contains(&entry.key.as_str()) {
            // Later staged writes to the same key supersede earlier ones;
            // the first occurrence already counted the row.
            continue;
        }
        seen.push(entry.key.as_str());

        match pre_by_key.get(key.as_str()) {
            Some(old) => {
                let changed = changed_cells(old, &entry.data);
                if changed > 0 {
                    summary.rows_updated += 1;
                    summary.cells_changed += changed;
                }
            }
            None => {
                summary.rows_added += 1;
                summary.cells_changed += entry.data.len() as i64;
            }
        }
    }

    summary
}

/// Number of cells whose value differs between two versions of a row.
fn changed_cells(old: &Row, new: &Row) -> i64 {
    let mut changed = 0i64;

    for (column, value) in new {
        if old.get(column) != Some(value) {
            changed += 1;
        }
    }
    for column in old.keys() {
        if !new.contains_key(column) {
            changed += 1;
        }
    }

    changed
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn upsert(key: &str, data: Row) -> StagedRow {
        StagedRow {
            key: key.to_string(),
            data,
            deleted: false,
        }
    }

    fn tombstone(key: &str) -> StagedRow {
        StagedRow {
            key: key.to_string(),
            data: Row::new(),
            deleted: true,
        }
    }

    const PK: &[&str] = &["id"];

    fn pks() -> Vec<String> {
        PK.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn pure_append_counts_added_rows() {
        let staged = vec![
            upsert("1", row(&[("id", json!(1)), ("name", json!("a"))])),
            upsert("2", row(&[("id", json!(2)), ("name", json!("b"))])),
        ];
        let diff = compute_diff(&[], &staged, &pks(), false);
        assert_eq!(
            diff,
            DiffSummary {
                rows_added: 2,
                rows_updated: 0,
                rows_deleted: 0,
                cells_changed: 4,
            }
        );
    }

    #[test]
    fn update_counts_only_differing_cells() {
        let pre = vec![row(&[("id", json!(1)), ("name", json!("a")), ("n", json!(5))])];
        let staged = vec![upsert(
            "1",
            row(&[("id", json!(1)), ("name", json!("z")), ("n", json!(5))]),
        )];
        let diff = compute_diff(&pre, &staged, &pks(), false);
        assert_eq!(diff.rows_updated, 1);
        assert_eq!(diff.cells_changed, 1);
        assert_eq!(diff.rows_added, 0);
    }

    #[test]
    fn identical_upsert_changes_nothing() {
        let pre = vec![row(&[("id", json!(1)), ("name", json!("a"))])];
        let staged = vec![upsert("1", pre[0].clone())];
        let diff = compute_diff(&pre, &staged, &pks(), false);
        assert_eq!(diff, DiffSummary::default());
    }

    #[test]
    fn deletes_require_the_delete_policy() {
        let pre = vec![row(&[("id", json!(1)), ("name", json!("a"))])];
        let staged = vec![tombstone("1")];

        let without = compute_diff(&pre, &staged, &pks(), false);
        assert_eq!(without, DiffSummary::default());

        let with = compute_diff(&pre, &staged, &pks(), true);
        assert_eq!(with.rows_deleted, 1);
        assert_eq!(with.cells_changed, 2);
    }

    #[test]
    fn projected_image_applies_upserts_and_deletes() {
        let pre = vec![
            row(&[("id", json!(1)), ("name", json!("a"))]),
            row(&[("id", json!(2)), ("name", json!("b"))]),
        ];
        let staged = vec![
            upsert("1", row(&[("id", json!(1)), ("name", json!("z"))])),
            tombstone("2"),
            upsert("3", row(&[("id", json!(3)), ("name", json!("c"))])),
        ];

        let image = projected_image(&pre, &staged, &pks(), true);
        assert_eq!(image.len(), 2);
        assert_eq!(image[0].get("name"), Some(&json!("z")));
        assert_eq!(image[1].get("id"), Some(&json!(3)));
    }
}
