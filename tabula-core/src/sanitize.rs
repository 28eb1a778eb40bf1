//! Table and message sanitization.
//!
//! Makes any table (extractor output or externally supplied) safe to store
//! and re-render: placeholder rows removed, header/row/cell caps applied,
//! labels defaulted. The whole pass is idempotent:
//! `sanitize(sanitize(t)) == sanitize(t)`.

use serde_json::Value;

use crate::models::{Message, Role, Table, TableSummary};

pub const MAX_TABLE_HEADERS: usize = 40;
pub const MAX_TABLE_ROWS: usize = 200;
pub const MAX_LABEL_LENGTH: usize = 120;
pub const MAX_CELL_LENGTH: usize = 2000;

fn cell_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Empty or dash-only (`-`, en dash, em dash) after whitespace removal.
fn is_placeholder_value(value: &Value) -> bool {
    let normalized: String = cell_display(value)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if normalized.is_empty() {
        return true;
    }
    normalized
        .chars()
        .all(|c| matches!(c, '-' | '\u{2013}' | '\u{2014}'))
}

/// A row whose cells are all empty or dash-only carries no data.
pub fn is_placeholder_row(row: &Value) -> bool {
    match row {
        Value::Array(cells) => cells.is_empty() || cells.iter().all(is_placeholder_value),
        Value::Object(map) => map.is_empty() || map.values().all(is_placeholder_value),
        other => is_placeholder_value(other),
    }
}

fn truncate_chars(s: &str, max: usize) -> (String, bool) {
    if s.chars().count() <= max {
        (s.to_string(), false)
    } else {
        (s.chars().take(max).collect(), true)
    }
}

fn sanitize_cell(value: &Value) -> Value {
    let s = cell_display(value);
    let (truncated, cut) = truncate_chars(&s, MAX_CELL_LENGTH);
    if cut {
        Value::String(format!("{truncated}..."))
    } else {
        Value::String(truncated)
    }
}

fn sanitize_headers(raw: &[String]) -> Vec<String> {
    raw.iter()
        .take(MAX_TABLE_HEADERS)
        .map(|h| truncate_chars(h.trim(), MAX_LABEL_LENGTH).0)
        .filter(|h| !h.is_empty())
        .collect()
}

/// Object rows are re-projected onto the sanitized header list (missing keys
/// become empty cells, unknown keys are dropped); array rows are clipped to
/// the header cap.
fn sanitize_row(row: &Value, headers: &[String]) -> Value {
    match row {
        Value::Array(cells) => Value::Array(
            cells
                .iter()
                .take(MAX_TABLE_HEADERS)
                .map(sanitize_cell)
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            if headers.is_empty() {
                for (key, value) in map.iter().take(MAX_TABLE_HEADERS) {
                    if !key.is_empty() {
                        out.insert(key.clone(), sanitize_cell(value));
                    }
                }
            } else {
                for key in headers {
                    out.insert(key.clone(), sanitize_cell(map.get(key).unwrap_or(&Value::Null)));
                }
            }
            Value::Object(out)
        }
        other => sanitize_cell(other),
    }
}

fn sanitize_label(raw: &str, index: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        format!("table-{}", index + 1)
    } else {
        truncate_chars(trimmed, MAX_LABEL_LENGTH).0
    }
}

/// Lowercased, trimmed chart hint; empty means no chart.
pub fn sanitize_chart_type(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_lowercase)
}

/// Sanitizes a batch of tables for storage. `row_limit` is the active limit
/// (`RowLimits::effective`); zero falls back to the hard row cap alone.
/// Tables that end up with
/// no headers and no rows are dropped, as are tables whose rows were all
/// placeholders.
pub fn sanitize_tables(raw: &[Table], row_limit: usize) -> Vec<Table> {
    let mut tables = Vec::with_capacity(raw.len());
    for (index, table) in raw.iter().enumerate() {
        let headers = sanitize_headers(&table.headers);
        let cleaned: Vec<Value> = table
            .rows
            .iter()
            .map(|row| sanitize_row(row, &headers))
            .filter(|row| !is_placeholder_row(row))
            .collect();

        // A supplied table whose rows all vanished carried no data at all.
        if !table.rows.is_empty() && cleaned.is_empty() {
            continue;
        }
        if cleaned.is_empty() && headers.is_empty() {
            continue;
        }

        let total_rows = if table.total_rows > 0 {
            table.total_rows
        } else {
            cleaned.len()
        };

        let shown = if row_limit > 0 {
            cleaned.len().min(row_limit).min(MAX_TABLE_ROWS)
        } else {
            cleaned.len().min(MAX_TABLE_ROWS)
        };
        let rows: Vec<Value> = cleaned.into_iter().take(shown).collect();

        tables.push(Table {
            label: sanitize_label(&table.label, index),
            headers,
            rows_truncated: total_rows > rows.len(),
            rows,
            total_rows,
            csv: table.csv.clone(),
            chart_type: sanitize_chart_type(table.chart_type.as_deref()),
            limit: (row_limit > 0).then_some(row_limit),
            max_rows: (row_limit > 0).then_some(row_limit),
        });
    }
    tables
}

/// Parses a stored `table_data` JSON column and sanitizes it. Malformed
/// payloads degrade to an empty list so reads stay available.
pub fn tables_from_value(raw: Option<&Value>, row_limit: usize) -> Vec<Table> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Vec::new();
    };
    match serde_json::from_value::<Vec<Table>>(raw.clone()) {
        Ok(tables) => sanitize_tables(&tables, row_limit),
        Err(e) => {
            tracing::warn!("discarding malformed table_data column: {e}");
            Vec::new()
        }
    }
}

/// Parses a stored `table_summary` JSON column, keeping only entries with a
/// usable row count.
pub fn summary_from_value(raw: Option<&Value>) -> Vec<TableSummary> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            item.get("totalRows")
                .and_then(Value::as_u64)
                .map(|n| TableSummary {
                    total_rows: n as usize,
                })
        })
        .collect()
}

/// Summary rows derived from already-sanitized tables, never from raw input.
pub fn build_summary(tables: &[Table]) -> Vec<TableSummary> {
    tables
        .iter()
        .map(|t| TableSummary {
            total_rows: if t.total_rows > 0 {
                t.total_rows
            } else {
                t.rows.len()
            },
        })
        .collect()
}

/// Normalizes a replayed message record: role defaulting, nested table and
/// summary cleanup. Used both when formatting stored rows and when the
/// client mirror ingests wire payloads.
pub fn sanitize_message_record(
    id: &str,
    role: &str,
    text: &str,
    time: i64,
    table_summary: &[TableSummary],
    table_data: &[Table],
    row_limit: usize,
) -> Message {
    Message {
        id: id.to_string(),
        role: Role::from_stored(role),
        text: text.to_string(),
        time,
        table_summary: table_summary.to_vec(),
        table_data: sanitize_tables(table_data, row_limit),
    }
}
