//! Rule definitions and evaluation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Severity, ValidationMessage, ValidationSummary};
use crate::storage::{ColumnType, Row, TableSchema, row_key};

/// Business rules attached to a dataset, keyed by column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub columns: Vec<ColumnRule>,
}

/// Constraints on one column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRule {
    pub column: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<Value>,
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

fn default_severity() -> Severity {
    Severity::Error
}

/// Evaluates a dataset's schema and rules against rows and cells.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    schema: Option<TableSchema>,
    rules: Option<RuleSet>,
}

impl Validator {
    pub fn new(schema: Option<TableSchema>, rules: Option<RuleSet>) -> Self {
        Self { schema, rules }
    }

    fn primary_keys(&self) -> Vec<String> {
        self.schema
            .as_ref()
            .map(TableSchema::primary_keys)
            .unwrap_or_else(|| vec!["id".to_string()])
    }

    /// Validate a full set of rows (CR and merge levels).
    pub fn validate_rows(&self, rows: &[Row]) -> ValidationSummary {
        let keys = self.primary_keys();
        let mut messages = Vec::new();

        for row in rows {
            let key = row_key(row, &keys);
            if key.split('|').any(str::is_empty) {
                messages.push(ValidationMessage {
                    severity: Severity::Fatal,
                    row_key: None,
                    column: Some(keys.join("|")),
                    message: "row is missing a primary key value".to_string(),
                });
                continue;
            }
            self.check_row(&key, row, &mut messages);
        }

        ValidationSummary::from_messages(messages)
    }

    /// Validate a single cell (cell level).
    pub fn validate_cell(&self, row_key: &str, column: &str, value: &Value) -> ValidationSummary {
        let mut messages = Vec::new();
        self.check_cell(row_key, column, value, &mut messages);
        ValidationSummary::from_messages(messages)
    }

    /// Validate the cells of a live-edit session (session level): only
    /// rules referencing the changed columns run.
    pub fn validate_cells(&self, cells: &[(String, String, Value)]) -> ValidationSummary {
        let mut messages = Vec::new();
        for (row_key, column, value) in cells {
            self.check_cell(row_key, column, value, &mut messages);
        }
        ValidationSummary::from_messages(messages)
    }

    fn check_row(&self, key: &str, row: &Row, messages: &mut Vec<ValidationMessage>) {
        if let Some(schema) = &self.schema {
            for column in &schema.columns {
                match row.get(&column.name) {
                    None | Some(Value::Null) => {
                        if column.required {
                            messages.push(ValidationMessage {
                                severity: Severity::Error,
                                row_key: Some(key.to_string()),
                                column: Some(column.name.clone()),
                                message: format!("required column '{}' is missing", column.name),
                            });
                        }
                    }
                    Some(value) => {
                        if !type_matches(column.data_type, value) {
                            messages.push(ValidationMessage {
                                severity: Severity::Error,
                                row_key: Some(key.to_string()),
                                column: Some(column.name.clone()),
                                message: format!(
                                    "value does not match declared type {:?}",
                                    column.data_type
                                ),
                            });
                        }
                    }
                }
            }

            for name in row.keys() {
                if !schema.columns.iter().any(|c| &c.name == name) {
                    messages.push(ValidationMessage {
                        severity: Severity::Warning,
                        row_key: Some(key.to_string()),
                        column: Some(name.clone()),
                        message: format!("column '{name}' is not declared in the schema"),
                    });
                }
            }
        }

        if let Some(rules) = &self.rules {
            for rule in &rules.columns {
                let value = row.get(&rule.column).cloned().unwrap_or(Value::Null);
                apply_rule(rule, key, &value, messages);
            }
        }
    }

    fn check_cell(
        &self,
        row_key: &str,
        column: &str,
        value: &Value,
        messages: &mut Vec<ValidationMessage>,
    ) {
        if let Some(schema) = &self.schema {
            match schema.columns.iter().find(|c| c.name == column) {
                Some(def) => {
                    if !value.is_null() && !type_matches(def.data_type, value) {
                        messages.push(ValidationMessage {
                            severity: Severity::Error,
                            row_key: Some(row_key.to_string()),
                            column: Some(column.to_string()),
                            message: format!(
                                "value does not match declared type {:?}",
                                def.data_type
                            ),
                        });
                    }
                    if value.is_null() && def.required {
                        messages.push(ValidationMessage {
                            severity: Severity::Error,
                            row_key: Some(row_key.to_string()),
                            column: Some(column.to_string()),
                            message: format!("required column '{column}' cannot be cleared"),
                        });
                    }
                }
                None => {
                    messages.push(ValidationMessage {
                        severity: Severity::Warning,
                        row_key: Some(row_key.to_string()),
                        column: Some(column.to_string()),
                        message: format!("column '{column}' is not declared in the schema"),
                    });
                }
            }
        }

        if let Some(rules) = &self.rules {
            for rule in rules.columns.iter().filter(|r| r.column == column) {
                apply_rule(rule, row_key, value, messages);
            }
        }
    }
}

fn apply_rule(rule: &ColumnRule, key: &str, value: &Value, messages: &mut Vec<ValidationMessage>) {
    let finding = |message: String| ValidationMessage {
        severity: rule.severity,
        row_key: Some(key.to_string()),
        column: Some(rule.column.clone()),
        message,
    };

    if value.is_null() {
        if rule.required {
            messages.push(finding(format!("column '{}' is required", rule.column)));
        }
        return;
    }

    if let (Some(min), Some(n)) = (rule.min, value.as_f64())
        && n < min
    {
        messages.push(finding(format!("value {n} is below the minimum {min}")));
    }

    if let (Some(max), Some(n)) = (rule.max, value.as_f64())
        && n > max
    {
        messages.push(finding(format!("value {n} is above the maximum {max}")));
    }

    if let Some(pattern) = &rule.pattern {
        match Regex::new(pattern) {
            Ok(re) => {
                if let Some(s) = value.as_str()
                    && !re.is_match(s)
                {
                    messages.push(finding(format!("value does not match pattern '{pattern}'")));
                }
            }
            Err(_) => {
                messages.push(ValidationMessage {
                    severity: Severity::Warning,
                    row_key: None,
                    column: Some(rule.column.clone()),
                    message: format!("rule pattern '{pattern}' is not a valid expression"),
                });
            }
        }
    }

    if !rule.allowed_values.is_empty() && !rule.allowed_values.contains(value) {
        messages.push(finding("value is not in the allowed set".to_string()));
    }
}

fn type_matches(expected: ColumnType, value: &Value) -> bool {
    match expected {
        ColumnType::Integer => value.is_i64() || value.is_u64(),
        ColumnType::Float => value.is_number(),
        ColumnType::String => value.is_string(),
        ColumnType::Boolean => value.is_boolean(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::ColumnDef;
    use crate::validation::ValidationState;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema {
            columns: vec![
                ColumnDef {
                    name: "id".to_string(),
                    data_type: ColumnType::Integer,
                    required: true,
                },
                ColumnDef {
                    name: "name".to_string(),
                    data_type: ColumnType::String,
                    required: false,
                },
            ],
            primary_key: None,
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn conforming_rows_pass() {
        let v = Validator::new(Some(schema()), None);
        let summary = v.validate_rows(&[
            row(&[("id", json!(1)), ("name", json!("a"))]),
            row(&[("id", json!(2)), ("name", json!("b"))]),
        ]);
        assert_eq!(summary.state, ValidationState::Pass);
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let v = Validator::new(Some(schema()), None);
        let summary = v.validate_rows(&[row(&[("id", json!("seven"))])]);
        assert!(summary.blocks_submit());
    }

    #[test]
    fn missing_primary_key_is_fatal() {
        let v = Validator::new(Some(schema()), None);
        let summary = v.validate_rows(&[row(&[("name", json!("orphan"))])]);
        assert_eq!(summary.counts.fatal, 1);
        assert!(summary.blocks_merge());
    }

    #[test]
    fn undeclared_column_only_warns() {
        let v = Validator::new(Some(schema()), None);
        let summary = v.validate_rows(&[row(&[("id", json!(1)), ("extra", json!(true))])]);
        assert_eq!(summary.state, ValidationState::Warnings);
        assert!(!summary.blocks_merge());
    }

    #[test]
    fn range_rule_applies_with_rule_severity() {
        let rules = RuleSet {
            columns: vec![ColumnRule {
                column: "id".to_string(),
                required: false,
                min: Some(10.0),
                max: None,
                pattern: None,
                allowed_values: Vec::new(),
                severity: Severity::Warning,
            }],
        };
        let v = Validator::new(Some(schema()), Some(rules));
        let summary = v.validate_rows(&[row(&[("id", json!(3))])]);
        assert_eq!(summary.counts.warning, 1);
        assert!(!summary.blocks_submit());
    }

    #[test]
    fn pattern_and_allowed_values_enforced_on_cells() {
        let rules = RuleSet {
            columns: vec![ColumnRule {
                column: "name".to_string(),
                required: false,
                min: None,
                max: None,
                pattern: Some("^[a-z]+$".to_string()),
                allowed_values: vec![json!("alpha"), json!("beta")],
                severity: Severity::Error,
            }],
        };
        let v = Validator::new(Some(schema()), Some(rules));

        let ok = v.validate_cell("1", "name", &json!("alpha"));
        assert_eq!(ok.state, ValidationState::Pass);

        let bad = v.validate_cell("1", "name", &json!("Gamma9"));
        assert!(bad.blocks_submit());
        assert_eq!(bad.counts.error, 2);
    }

    #[test]
    fn session_level_checks_only_changed_columns() {
        let v = Validator::new(Some(schema()), None);
        let summary = v.validate_cells(&[
            ("1".to_string(), "name".to_string(), json!("fine")),
            ("2".to_string(), "id".to_string(), json!("bad")),
        ]);
        assert_eq!(summary.counts.error, 1);
    }
}
