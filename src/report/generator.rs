//! Report generation.
//!
//! Every command result is wrapped in a [`Report`] with run metadata and
//! rendered either as pretty JSON or as Markdown. The Markdown renderer
//! works on the serialized JSON form, so any serializable result can be
//! shown: flat mappings become two-column tables, mappings of records and
//! sequences of records become wide tables, and anything else becomes a
//! section per field.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Run information shown above a result.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub command: String,
    pub generated_at: DateTime<Utc>,
    pub store_url: String,
    /// Index rows skipped because of an unexpected shape.
    pub malformed_rows: u64,
    pub duration_seconds: f64,
}

/// A command result with its metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Report<T: Serialize> {
    pub metadata: ReportMetadata,
    pub result: T,
}

/// Generate a JSON report.
pub fn generate_json_report<T: Serialize>(report: &Report<T>) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Generate a Markdown report.
pub fn generate_markdown_report<T: Serialize>(report: &Report<T>) -> Result<String> {
    let mut output = String::new();

    output.push_str(&format!("# areascope: {}\n\n", report.metadata.command));
    output.push_str(&generate_metadata_section(&report.metadata));

    output.push_str("## Result\n\n");
    let value = serde_json::to_value(&report.result)?;
    render_value(&mut output, 3, &value);

    output.push_str(&generate_footer());

    Ok(output)
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Store:** {}\n", metadata.store_url));
    if metadata.malformed_rows > 0 {
        section.push_str(&format!(
            "- **Malformed Rows Skipped:** {}\n",
            metadata.malformed_rows
        ));
    }
    section.push_str(&format!(
        "- **Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

fn generate_footer() -> String {
    "---\n\n*Report generated by areascope*\n".to_string()
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

fn is_record(value: &Value) -> bool {
    matches!(value, Value::Object(_))
}

/// Render any JSON value at the given heading depth.
fn render_value(out: &mut String, depth: usize, value: &Value) {
    match value {
        Value::Object(map) if map.is_empty() => out.push_str("_No data._\n\n"),
        Value::Array(items) if items.is_empty() => out.push_str("_No data._\n\n"),

        // Area -> count and similar.
        Value::Object(map) if map.values().all(is_scalar) => {
            let rows: Vec<Vec<String>> = map
                .iter()
                .map(|(key, value)| vec![escape(key), cell(value)])
                .collect();
            push_table(out, &["Key".to_string(), "Value".to_string()], &rows);
        }

        // Area -> record.
        Value::Object(map) if map.values().all(is_record) => {
            let records: Vec<(Option<&str>, &Value)> =
                map.iter().map(|(k, v)| (Some(k.as_str()), v)).collect();
            push_record_table(out, &records);
        }

        Value::Array(items) if items.iter().all(is_record) => {
            let records: Vec<(Option<&str>, &Value)> = items.iter().map(|v| (None, v)).collect();
            push_record_table(out, &records);
        }

        Value::Array(items) => {
            for item in items {
                out.push_str(&format!("- {}\n", cell(item)));
            }
            out.push('\n');
        }

        // A struct with mixed fields: one line or section per field.
        Value::Object(map) => {
            let mut scalars_written = false;
            for (key, value) in map.iter().filter(|(_, v)| is_scalar(v)) {
                out.push_str(&format!("- **{}:** {}\n", title_case(key), cell(value)));
                scalars_written = true;
            }
            if scalars_written {
                out.push('\n');
            }
            for (key, value) in map.iter().filter(|(_, v)| !is_scalar(v)) {
                out.push_str(&format!("{} {}\n\n", "#".repeat(depth.min(6)), title_case(key)));
                render_value(out, depth + 1, value);
            }
        }

        scalar => out.push_str(&format!("{}\n\n", cell(scalar))),
    }
}

/// Table of records, nested fields flattened into dotted columns.
fn push_record_table(out: &mut String, records: &[(Option<&str>, &Value)]) {
    let flattened: Vec<Vec<(String, Value)>> = records
        .iter()
        .map(|(_, record)| {
            let mut fields = Vec::new();
            flatten("", record, &mut fields);
            fields
        })
        .collect();

    // Columns in first-seen order.
    let mut columns: Vec<String> = Vec::new();
    for fields in &flattened {
        for (name, _) in fields {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
    }

    let keyed = records.iter().any(|(key, _)| key.is_some());
    let mut header = Vec::new();
    if keyed {
        header.push("Key".to_string());
    }
    header.extend(columns.iter().map(|c| escape(c)));

    let rows: Vec<Vec<String>> = records
        .iter()
        .zip(&flattened)
        .map(|((key, _), fields)| {
            let mut row = Vec::new();
            if keyed {
                row.push(escape(key.unwrap_or_default()));
            }
            for column in &columns {
                let value = fields
                    .iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, v)| cell(v))
                    .unwrap_or_default();
                row.push(value);
            }
            row
        })
        .collect();

    push_table(out, &header, &rows);
}

fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, value) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&name, value, out);
            }
        }
        Value::Object(_) => {}
        other => out.push((prefix.to_string(), other.clone())),
    }
}

fn push_table(out: &mut String, header: &[String], rows: &[Vec<String>]) {
    out.push_str(&format!("| {} |\n", header.join(" | ")));
    out.push_str(&format!(
        "|{}\n",
        header.iter().map(|_| "---|").collect::<String>()
    ));
    for row in rows {
        out.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    out.push('\n');
}

/// Format one value for a table cell.
fn cell(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => escape(s),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{:.4}", f),
            _ => n.to_string(),
        },
        other => escape(&other.to_string()),
    }
}

fn escape(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
