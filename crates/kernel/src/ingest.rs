//! Upload ingestion.
//!
//! Turns uploaded bytes into table rows. Delimited text and JSON row
//! arrays are supported; columnar container formats are refused rather
//! than half-parsed.

use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::storage::{ColumnType, Row, TableSchema};

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Csv,
    JsonRows,
}

/// Infer the format from a filename.
pub fn format_for_filename(filename: &str) -> AppResult<UploadFormat> {
    let lower = filename.to_lowercase();
    if lower.ends_with(".csv") || lower.ends_with(".tsv") {
        Ok(UploadFormat::Csv)
    } else if lower.ends_with(".json") {
        Ok(UploadFormat::JsonRows)
    } else {
        let extension = lower.rsplit('.').next().unwrap_or("").to_string();
        Err(AppError::UnsupportedFormat(extension))
    }
}

/// Parse uploaded bytes into rows.
///
/// When the dataset declares a schema, CSV fields are coerced to the
/// declared column types; undeclared columns fall back to guessing.
pub fn parse_upload(
    bytes: &[u8],
    format: UploadFormat,
    schema: Option<&TableSchema>,
) -> AppResult<Vec<Row>> {
    match format {
        UploadFormat::Csv => parse_csv(bytes, schema),
        UploadFormat::JsonRows => parse_json_rows(bytes),
    }
}

fn parse_csv(bytes: &[u8], schema: Option<&TableSchema>) -> AppResult<Vec<Row>> {
    let delimiter = sniff_delimiter(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| AppError::InvalidFile(format!("unreadable header row: {e}")))?
        .clone();

    if headers.is_empty() {
        return Err(AppError::InvalidFile("file has no header row".to_string()));
    }

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record =
            record.map_err(|e| AppError::InvalidFile(format!("bad record at line {}: {e}", i + 2)))?;

        let mut row = Row::new();
        for (header, field) in headers.iter().zip(record.iter()) {
            let declared = schema
                .and_then(|s| s.columns.iter().find(|c| c.name == header))
                .map(|c| c.data_type);
            row.insert(header.to_string(), coerce_field(field, declared));
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(AppError::InvalidFile("file contains no data rows".to_string()));
    }

    Ok(rows)
}

fn parse_json_rows(bytes: &[u8]) -> AppResult<Vec<Row>> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| AppError::InvalidFile(format!("not valid JSON: {e}")))?;

    let rows = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("rows") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(AppError::InvalidFile(
                    "expected an array of row objects".to_string(),
                ));
            }
        },
        _ => {
            return Err(AppError::InvalidFile(
                "expected an array of row objects".to_string(),
            ));
        }
    };

    if rows.is_empty() {
        return Err(AppError::InvalidFile("file contains no data rows".to_string()));
    }

    rows.into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            other => Err(AppError::InvalidFile(format!(
                "row is not an object: {other}"
            ))),
        })
        .collect()
}

/// Pick tab when the first line contains tabs but no commas.
fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let first_line = bytes.split(|&b| b == b'\n').next().unwrap_or(&[]);
    if first_line.contains(&b'\t') && !first_line.contains(&b',') {
        b'\t'
    } else {
        b','
    }
}

/// Coerce a CSV field to the declared type, or guess when undeclared.
fn coerce_field(field: &str, declared: Option<ColumnType>) -> Value {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    match declared {
        Some(ColumnType::Integer) => trimmed
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(field.to_string())),
        Some(ColumnType::Float) => trimmed
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| Value::String(field.to_string())),
        Some(ColumnType::Boolean) => match trimmed.to_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => Value::String(field.to_string()),
        },
        Some(ColumnType::String) => Value::String(field.to_string()),
        None => guess_value(trimmed, field),
    }
}

fn guess_value(trimmed: &str, original: &str) -> Value {
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>()
        && let Some(n) = serde_json::Number::from_f64(f)
    {
        return Value::Number(n);
    }
    match trimmed {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(original.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::ColumnDef;
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

    #[test]
    fn filename_extension_selects_format() {
        assert_eq!(format_for_filename("data.csv").unwrap(), UploadFormat::Csv);
        assert_eq!(format_for_filename("Data.TSV").unwrap(), UploadFormat::Csv);
        assert_eq!(
            format_for_filename("rows.json").unwrap(),
            UploadFormat::JsonRows
        );
        assert!(matches!(
            format_for_filename("table.parquet"),
            Err(AppError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn csv_rows_are_coerced_by_schema() {
        let bytes = b"id,name\n1,alpha\n2,beta\n";
        let rows = parse_upload(bytes, UploadFormat::Csv, Some(&schema())).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&json!(1)));
        assert_eq!(rows[1].get("name"), Some(&json!("beta")));
    }

    #[test]
    fn csv_without_schema_guesses_types() {
        let bytes = b"a,b,c\n1,2.5,true\n";
        let rows = parse_upload(bytes, UploadFormat::Csv, None).unwrap();
        assert_eq!(rows[0].get("a"), Some(&json!(1)));
        assert_eq!(rows[0].get("b"), Some(&json!(2.5)));
        assert_eq!(rows[0].get("c"), Some(&json!(true)));
    }

    #[test]
    fn tsv_is_sniffed() {
        let bytes = b"id\tname\n1\talpha\n";
        let rows = parse_upload(bytes, UploadFormat::Csv, Some(&schema())).unwrap();
        assert_eq!(rows[0].get("name"), Some(&json!("alpha")));
    }

    #[test]
    fn empty_csv_is_invalid() {
        let bytes = b"id,name\n";
        assert!(matches!(
            parse_upload(bytes, UploadFormat::Csv, None),
            Err(AppError::InvalidFile(_))
        ));
    }

    #[test]
    fn json_array_and_wrapped_rows_both_parse() {
        let array = br#"[{"id":1},{"id":2}]"#;
        assert_eq!(parse_upload(array, UploadFormat::JsonRows, None).unwrap().len(), 2);

        let wrapped = br#"{"rows":[{"id":3}]}"#;
        assert_eq!(
            parse_upload(wrapped, UploadFormat::JsonRows, None).unwrap()[0].get("id"),
            Some(&json!(3))
        );

        let scalar = br#"42"#;
        assert!(parse_upload(scalar, UploadFormat::JsonRows, None).is_err());
    }
}
