//! Rule validation.
//!
//! Rules run at four levels — single cell, live-edit session, full CR
//! staging, and projected post-merge image — and every level produces the
//! same [`ValidationSummary`] shape. `error` and `fatal` findings block
//! submit and merge; warnings are surfaced but do not block; a timed-out
//! run reports `partial_pass`, which also fails the merge gate.

mod rules;

pub use rules::{ColumnRule, RuleSet, Validator};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::Row;

/// Finding severity, ordered from advisory to blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

/// Overall outcome of a validation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    Pass,
    Warnings,
    Blocked,
    PartialPass,
}

/// Finding counts by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub info: u64,
    pub warning: u64,
    pub error: u64,
    pub fatal: u64,
}

/// One diagnostic finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub message: String,
}

/// Result of a validation run at any level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub state: ValidationState,
    pub counts: SeverityCounts,
    pub messages: Vec<ValidationMessage>,
}

impl ValidationSummary {
    /// Build a summary from raw findings.
    pub fn from_messages(messages: Vec<ValidationMessage>) -> Self {
        let mut counts = SeverityCounts::default();
        for m in &messages {
            match m.severity {
                Severity::Info => counts.info += 1,
                Severity::Warning => counts.warning += 1,
                Severity::Error => counts.error += 1,
                Severity::Fatal => counts.fatal += 1,
            }
        }

        let state = if counts.error > 0 || counts.fatal > 0 {
            ValidationState::Blocked
        } else if counts.warning > 0 {
            ValidationState::Warnings
        } else {
            ValidationState::Pass
        };

        Self {
            state,
            counts,
            messages,
        }
    }

    /// Summary for a run that hit its deadline.
    pub fn timed_out() -> Self {
        Self {
            state: ValidationState::PartialPass,
            counts: SeverityCounts::default(),
            messages: vec![ValidationMessage {
                severity: Severity::Warning,
                row_key: None,
                column: None,
                message: "validation timed out".to_string(),
            }],
        }
    }

    /// Whether this run blocks submit.
    pub fn blocks_submit(&self) -> bool {
        self.counts.error > 0 || self.counts.fatal > 0
    }

    /// Whether this run blocks merge. A partial pass never satisfies the
    /// merge gate.
    pub fn blocks_merge(&self) -> bool {
        self.blocks_submit() || self.state == ValidationState::PartialPass
    }
}

/// Deadline for a validation run before it degrades to `partial_pass`.
pub const VALIDATION_DEADLINE: Duration = Duration::from_millis(500);

/// Run a full-row validation under the standard deadline.
///
/// Rule evaluation is CPU-bound; the deadline exists so a pathological
/// rule set degrades to `partial_pass` rather than stalling the request.
pub async fn validate_rows_with_deadline(
    validator: &Validator,
    rows: &[Row],
    deadline: Duration,
) -> ValidationSummary {
    let validator = validator.clone();
    let rows = rows.to_vec();
    let task = tokio::task::spawn_blocking(move || validator.validate_rows(&rows));

    match tokio::time::timeout(deadline, task).await {
        Ok(Ok(summary)) => summary,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "validation task panicked");
            ValidationSummary::timed_out()
        }
        Err(_) => ValidationSummary::timed_out(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn msg(severity: Severity) -> ValidationMessage {
        ValidationMessage {
            severity,
            row_key: None,
            column: None,
            message: "finding".to_string(),
        }
    }

    #[test]
    fn empty_run_passes() {
        let summary = ValidationSummary::from_messages(Vec::new());
        assert_eq!(summary.state, ValidationState::Pass);
        assert!(!summary.blocks_submit());
        assert!(!summary.blocks_merge());
    }

    #[test]
    fn warnings_surface_but_do_not_block() {
        let summary = ValidationSummary::from_messages(vec![msg(Severity::Warning)]);
        assert_eq!(summary.state, ValidationState::Warnings);
        assert_eq!(summary.counts.warning, 1);
        assert!(!summary.blocks_submit());
        assert!(!summary.blocks_merge());
    }

    #[test]
    fn any_error_blocks_submit_and_merge() {
        for severity in [Severity::Error, Severity::Fatal] {
            let summary =
                ValidationSummary::from_messages(vec![msg(Severity::Warning), msg(severity)]);
            assert_eq!(summary.state, ValidationState::Blocked);
            assert!(summary.blocks_submit());
            assert!(summary.blocks_merge());
        }
    }

    #[test]
    fn partial_pass_blocks_merge_only() {
        let summary = ValidationSummary::timed_out();
        assert_eq!(summary.state, ValidationState::PartialPass);
        assert!(!summary.blocks_submit());
        assert!(summary.blocks_merge());
        assert_eq!(summary.messages[0].message, "validation timed out");
    }
}
