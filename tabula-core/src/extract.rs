//! Table extraction from automation-engine replies.
//!
//! The engine's reply shape is not fixed. Extraction walks a fixed, ordered
//! rule table (predicate + selector, first match wins) so new reply shapes
//! stay additive: a direct array under `result`/`body`/`data`, a nested
//! `result.data` array when no text was found, and a scalar reply string
//! under `body`/`text`/`message`/`data`. A `sql` field becomes a fenced code
//! block; a `chart_type` hint attaches to the next discovered table only.

use serde_json::Value;

use crate::config::TableLimitsConfig;
use crate::error::TabulaError;
use crate::models::Table;

/// Shown when the engine returned nothing renderable.
pub const FALLBACK_REPLY: &str =
    "Sorry, this question is too complex for the assistant right now - please try a different one.";

/// Row limits shared between server and client.
#[derive(Debug, Clone, Copy)]
pub struct RowLimits {
    pub default_rows: usize,
    pub max_rows: usize,
}

impl From<&TableLimitsConfig> for RowLimits {
    fn from(cfg: &TableLimitsConfig) -> Self {
        Self {
            default_rows: cfg.default_rows,
            max_rows: cfg.max_rows,
        }
    }
}

impl RowLimits {
    /// Active limit for a caller-supplied override: `min(caller, max_rows)`,
    /// where zero means "no limit".
    pub fn effective(&self, caller: Option<usize>) -> usize {
        match (caller.filter(|l| *l > 0), (self.max_rows > 0).then_some(self.max_rows)) {
            (Some(c), Some(m)) => c.min(m),
            (Some(c), None) => c,
            (None, Some(m)) => m,
            (None, None) => 0,
        }
    }
}

/// Normalized artifact produced from one engine reply.
///
/// `text` already carries the markdown rendition of every discovered table;
/// `tables` holds the untruncated drafts for the sanitizer.
#[derive(Debug, Clone, Default)]
pub struct EngineReply {
    pub text: String,
    pub tables: Vec<Table>,
}

// ---------------------------------------------------------------------------
// Reply envelope classification
// ---------------------------------------------------------------------------

/// Turns an arbitrary engine reply into text plus table drafts.
///
/// Recognized envelopes: a bare array of records (first element inspected),
/// `{response: {statusCode, body}}` wrappers, objects with a bare
/// `statusCode`, and plain objects or scalars. A non-2xx status anywhere is a
/// hard [`TabulaError::UpstreamFailure`]. An empty result falls back to
/// [`FALLBACK_REPLY`].
pub fn extract_reply(result: &Value, limits: &RowLimits) -> Result<EngineReply, TabulaError> {
    let mut reply = match result {
        Value::Array(items) if !items.is_empty() => classify_object(&items[0], limits)?,
        Value::Array(_) => EngineReply::default(),
        Value::Object(_) => classify_object(result, limits)?,
        Value::Null => EngineReply::default(),
        Value::String(s) => EngineReply {
            text: s.trim().to_string(),
            tables: Vec::new(),
        },
        other => EngineReply {
            text: other.to_string(),
            tables: Vec::new(),
        },
    };

    if reply.text.trim().is_empty() {
        reply.text = FALLBACK_REPLY.to_string();
    }
    Ok(reply)
}

fn classify_object(value: &Value, limits: &RowLimits) -> Result<EngineReply, TabulaError> {
    if !value.is_object() {
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        return Ok(EngineReply {
            text,
            tables: Vec::new(),
        });
    }

    // `{response: {statusCode, body}}` wrapper takes precedence.
    if let Some(status) = value
        .get("response")
        .and_then(|r| r.get("statusCode"))
        .and_then(Value::as_i64)
    {
        let response = value.get("response").unwrap_or(&Value::Null);
        if !(200..300).contains(&status) {
            return Err(upstream_failure(status, response));
        }
        let body = response.get("body").unwrap_or(&Value::Null);
        return Ok(EngineReply {
            text: value_to_text(body),
            tables: Vec::new(),
        });
    }

    if let Some(status) = value.get("statusCode").and_then(Value::as_i64) {
        if !(200..300).contains(&status) {
            return Err(upstream_failure(status, value));
        }
    }

    let mut reply = extract_body(value, limits);
    if reply.text.is_empty() {
        reply.text = value.to_string();
    }
    Ok(reply)
}

fn upstream_failure(status: i64, detail: &Value) -> TabulaError {
    TabulaError::UpstreamFailure {
        status: status.clamp(0, i64::from(u16::MAX)) as u16,
        detail: detail.to_string(),
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Body extraction rules
// ---------------------------------------------------------------------------

/// Scalar reply fields, probed in priority order.
const TEXT_FIELDS: [&str; 4] = ["body", "text", "message", "data"];

struct TableRule {
    label: &'static str,
    /// Skipped unless the reply text is still empty.
    needs_empty_text: bool,
    select: fn(&Value) -> Option<&Vec<Value>>,
}

fn select_result(v: &Value) -> Option<&Vec<Value>> {
    v.get("result").and_then(Value::as_array)
}

fn select_body(v: &Value) -> Option<&Vec<Value>> {
    v.get("body").and_then(Value::as_array)
}

fn select_data(v: &Value) -> Option<&Vec<Value>> {
    v.get("data").and_then(Value::as_array)
}

fn select_result_data(v: &Value) -> Option<&Vec<Value>> {
    v.get("result")
        .filter(|r| r.is_object())
        .and_then(|r| r.get("data"))
        .and_then(Value::as_array)
}

const TABLE_RULES: [TableRule; 4] = [
    TableRule {
        label: "result",
        needs_empty_text: false,
        select: select_result,
    },
    TableRule {
        label: "body",
        needs_empty_text: false,
        select: select_body,
    },
    TableRule {
        label: "data",
        needs_empty_text: false,
        select: select_data,
    },
    TableRule {
        label: "result.data",
        needs_empty_text: true,
        select: select_result_data,
    },
];

fn extract_body(obj: &Value, limits: &RowLimits) -> EngineReply {
    let mut text = TEXT_FIELDS
        .iter()
        .find_map(|field| obj.get(*field).and_then(Value::as_str))
        .unwrap_or("")
        .to_string();

    if let Some(sql) = obj.get("sql").and_then(Value::as_str) {
        let sql = sql.trim();
        if !sql.is_empty() {
            let prefix = if text.is_empty() {
                String::new()
            } else {
                format!("{text}\n\n")
            };
            text = format!("{prefix}SQL:\n```sql\n{sql}\n```");
        }
    }

    // Consumed by the first discovered table only; dropped if none follows.
    let mut pending_chart = obj
        .get("chart_type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string);

    let mut tables = Vec::new();
    for rule in &TABLE_RULES {
        if rule.needs_empty_text && !text.is_empty() {
            continue;
        }
        if let Some(rows) = (rule.select)(obj) {
            let chart = pending_chart.take();
            let (table, markdown) = draft_table(rows, rule.label, chart, limits);
            if !markdown.is_empty() {
                if text.is_empty() {
                    text = markdown;
                } else {
                    text = format!("{text}\n\n{markdown}");
                }
            }
            tables.push(table);
            break;
        }
    }

    if text.is_empty() {
        for field in ["body", "data"] {
            if let Some(v) = obj.get(field).filter(|v| v.is_object()) {
                text = v.to_string();
                break;
            }
        }
    }

    EngineReply { text, tables }
}

/// Builds the untruncated table draft plus its (row-limited) markdown.
fn draft_table(
    rows: &[Value],
    label: &str,
    chart_type: Option<String>,
    limits: &RowLimits,
) -> (Table, String) {
    let headers = collect_headers(rows);
    let csv = rows_to_csv(rows, &headers);
    let markdown = rows_to_markdown(rows, &headers, limits.max_rows);

    let table = Table {
        label: label.to_string(),
        headers,
        rows: rows.to_vec(),
        rows_truncated: false,
        total_rows: rows.len(),
        csv: if csv.is_empty() { None } else { Some(csv) },
        chart_type,
        limit: None,
        max_rows: None,
    };
    (table, markdown)
}

/// Union of object keys across all rows, in order of first appearance.
pub fn collect_headers(rows: &[Value]) -> Vec<String> {
    let mut headers: Vec<String> = Vec::new();
    for row in rows {
        if let Value::Object(map) = row {
            for key in map.keys() {
                if !key.is_empty() && !headers.iter().any(|h| h == key) {
                    headers.push(key.clone());
                }
            }
        }
    }
    headers
}

// ---------------------------------------------------------------------------
// Markdown
// ---------------------------------------------------------------------------

fn markdown_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(v) => cell_display(v).replace('|', "\\|").replace('\n', " "),
    }
}

/// Pipe-delimited markdown table with a `---` separator row. When `limit`
/// cuts rows off, a blockquote line reports total vs shown counts.
pub fn rows_to_markdown(rows: &[Value], headers: &[String], limit: usize) -> String {
    if rows.is_empty() || headers.is_empty() {
        return String::new();
    }

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(format!(
        "| {} |",
        headers
            .iter()
            .map(|h| markdown_cell(Some(&Value::String(h.clone()))))
            .collect::<Vec<_>>()
            .join(" | ")
    ));
    lines.push(format!(
        "| {} |",
        headers.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
    ));

    let shown = if limit > 0 { rows.len().min(limit) } else { rows.len() };
    for row in &rows[..shown] {
        let cells: Vec<String> = match row {
            Value::Object(map) => headers.iter().map(|h| markdown_cell(map.get(h))).collect(),
            _ => headers.iter().map(|_| String::new()).collect(),
        };
        lines.push(format!("| {} |", cells.join(" | ")));
    }

    let mut markdown = lines.join("\n");
    if limit > 0 && rows.len() > limit {
        markdown.push_str(&format!(
            "\n> {} rows total, showing the first {}",
            rows.len(),
            limit
        ));
    }
    markdown
}

// ---------------------------------------------------------------------------
// CSV (RFC4180-style)
// ---------------------------------------------------------------------------

fn cell_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Quotes a cell when it carries a comma, quote, or newline; internal quotes
/// are doubled and `\r\n` collapses to `\n`.
pub fn csv_escape(value: &Value) -> String {
    let s = cell_display(value).replace("\r\n", "\n");
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s
    }
}

/// Builds the full (untruncated) CSV for a row set. Header order drives the
/// columns; array rows are emitted positionally when no headers exist.
pub fn rows_to_csv(rows: &[Value], headers: &[String]) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    if !headers.is_empty() {
        lines.push(
            headers
                .iter()
                .map(|h| csv_escape(&Value::String(h.clone())))
                .collect::<Vec<_>>()
                .join(","),
        );
        for row in rows {
            let cells: Vec<String> = match row {
                Value::Object(map) => headers
                    .iter()
                    .map(|h| csv_escape(map.get(h).unwrap_or(&Value::Null)))
                    .collect(),
                _ => headers.iter().map(|_| String::new()).collect(),
            };
            lines.push(cells.join(","));
        }
    } else {
        for row in rows {
            match row {
                Value::Array(cells) => {
                    lines.push(cells.iter().map(csv_escape).collect::<Vec<_>>().join(","));
                }
                other => lines.push(csv_escape(other)),
            }
        }
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Numeric heuristic
// ---------------------------------------------------------------------------

/// Lenient numeric parse used for chart datasets: strips percent signs,
/// thousands separators, currency symbols, and any other non-numeric
/// characters. Values with no digits at all resolve to `None`, never zero.
pub fn parse_numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Null => None,
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        other => {
            let s = cell_display(other);
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            // Unit suffixes and currency prefixes are noise, not data.
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
        }
    }
}
