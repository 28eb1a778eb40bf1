//! Rendering adapter: pure data transforms consumed by a host renderer.
//!
//! Nothing here touches a UI. Chart intents normalize to one of four
//! renderable families, datasets are assembled from sanitized rows, and the
//! CSV export artifact is rebuilt with exactly the quoting the server used,
//! so server-generated and client-regenerated CSV agree byte for byte.

use serde::Serialize;
use serde_json::Value;

use crate::extract::{parse_numeric, rows_to_csv};
use crate::models::Table;

pub const COLOR_PALETTE: [&str; 10] = [
    "#6366f1", "#f97316", "#10b981", "#ec4899", "#0ea5e9",
    "#facc15", "#a855f7", "#14b8a6", "#ef4444", "#8b5cf6",
];

/// UTF-8 byte-order mark prepended to exported CSV files.
pub const CSV_BOM: &str = "\u{feff}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Pie,
    Doughnut,
    Line,
}

impl ChartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartKind::Bar => "bar",
            ChartKind::Pie => "pie",
            ChartKind::Doughnut => "doughnut",
            ChartKind::Line => "line",
        }
    }

    pub fn is_pie_like(&self) -> bool {
        matches!(self, ChartKind::Pie | ChartKind::Doughnut)
    }
}

/// Maps a free-form chart intent onto a renderable family. `table` and
/// unrecognized intents mean "no chart".
pub fn normalize_chart_intent(raw: &str) -> Option<ChartKind> {
    match raw.trim().to_lowercase().as_str() {
        "column" | "bar" | "histogram" => Some(ChartKind::Bar),
        "pie" => Some(ChartKind::Pie),
        "donut" | "doughnut" => Some(ChartKind::Doughnut),
        "line" | "area" => Some(ChartKind::Line),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub key: String,
    pub label: String,
    pub values: Vec<f64>,
    pub color_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub datasets: Vec<Dataset>,
    pub dimension_key: String,
}

/// Positional placeholder headers for array rows; object rows contribute
/// their own keys.
pub fn infer_headers(rows: &[Value]) -> Vec<String> {
    for row in rows {
        match row {
            Value::Array(cells) => {
                return (0..cells.len()).map(|i| format!("col-{}", i + 1)).collect();
            }
            Value::Object(map) if !map.is_empty() => {
                return map.keys().cloned().collect();
            }
            _ => continue,
        }
    }
    Vec::new()
}

/// Re-keys array rows through the header list; object rows pass through.
fn normalize_rows(rows: &[Value], headers: &[String]) -> Vec<serde_json::Map<String, Value>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        match row {
            Value::Object(map) => out.push(map.clone()),
            Value::Array(cells) if !headers.is_empty() => {
                let mut map = serde_json::Map::new();
                for (header, cell) in headers.iter().zip(cells.iter()) {
                    map.insert(header.clone(), cell.clone());
                }
                out.push(map);
            }
            _ => {}
        }
    }
    out
}

fn is_numeric_column(rows: &[serde_json::Map<String, Value>], key: &str) -> bool {
    rows.iter()
        .any(|row| row.get(key).and_then(parse_numeric).is_some())
}

/// Assembles chart datasets from a sanitized table.
///
/// Numeric columns are any column where at least one cell parses; the
/// dimension is the first non-numeric header (falling back to the first
/// header that is not the chosen metric). Pie-like charts take only the
/// first numeric column. Datasets whose values are all zero or non-finite
/// are dropped; with none left, no chart is produced.
pub fn build_datasets(table: &Table, kind: ChartKind) -> Option<ChartData> {
    if table.rows.is_empty() {
        return None;
    }
    let headers: Vec<String> = if table.headers.is_empty() {
        infer_headers(&table.rows)
    } else {
        table.headers.clone()
    };
    if headers.is_empty() {
        return None;
    }

    let rows = normalize_rows(&table.rows, &headers);
    if rows.is_empty() {
        return None;
    }

    let numeric_keys: Vec<&String> = headers
        .iter()
        .filter(|key| is_numeric_column(&rows, key))
        .collect();
    if numeric_keys.is_empty() {
        return None;
    }

    let dimension_key = headers
        .iter()
        .find(|key| !numeric_keys.contains(key))
        .or_else(|| headers.iter().find(|key| *key != numeric_keys[0]))
        .or_else(|| headers.first())?
        .clone();

    let metric_keys: Vec<&String> = if kind.is_pie_like() {
        vec![numeric_keys[0]]
    } else {
        numeric_keys
    };

    let labels: Vec<String> = rows
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let raw = row.get(&dimension_key).map(display_label).unwrap_or_default();
            if raw.trim().is_empty() {
                format!("item-{}", idx + 1)
            } else {
                raw
            }
        })
        .collect();

    let datasets: Vec<Dataset> = metric_keys
        .iter()
        .enumerate()
        .map(|(idx, key)| Dataset {
            key: (*key).clone(),
            label: (*key).clone(),
            values: rows
                .iter()
                .map(|row| {
                    row.get(*key)
                        .and_then(parse_numeric)
                        .filter(|v| v.is_finite())
                        .unwrap_or(0.0)
                })
                .collect(),
            color_index: idx,
        })
        .filter(|dataset| dataset.values.iter().any(|v| v.is_finite() && *v != 0.0))
        .collect();

    if datasets.is_empty() {
        return None;
    }

    Some(ChartData {
        labels,
        datasets,
        dimension_key,
    })
}

fn display_label(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Colors cycle a fixed palette by dataset index; pie slices index by row.
pub fn color(index: usize) -> &'static str {
    COLOR_PALETTE[index % COLOR_PALETTE.len()]
}

pub fn hex_to_rgba(hex: &str, alpha: f64) -> String {
    let parsed = hex.trim_start_matches('#');
    if parsed.len() != 6 {
        return hex.to_string();
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&parsed[range], 16);
    match (channel(0..2), channel(2..4), channel(4..6)) {
        (Ok(r), Ok(g), Ok(b)) => format!("rgba({r}, {g}, {b}, {alpha})"),
        _ => hex.to_string(),
    }
}

/// Renderer-agnostic chart config handed to the external charting library.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSpec {
    #[serde(rename = "type")]
    pub kind: ChartKind,
    pub data: Value,
    pub options: Value,
}

/// Builds the full chart config for one table, or `None` when the intent or
/// the data does not yield a renderable chart.
pub fn build_chart_spec(table: &Table) -> Option<ChartSpec> {
    let kind = normalize_chart_intent(table.chart_type.as_deref()?)?;
    let data = build_datasets(table, kind)?;

    let datasets: Vec<Value> = data
        .datasets
        .iter()
        .enumerate()
        .map(|(idx, dataset)| {
            if kind.is_pie_like() {
                serde_json::json!({
                    "label": dataset.label,
                    "data": dataset.values,
                    "backgroundColor": dataset
                        .values
                        .iter()
                        .enumerate()
                        .map(|(segment, _)| color(segment))
                        .collect::<Vec<_>>(),
                    "borderColor": "#ffffff",
                    "borderWidth": 1,
                })
            } else {
                let base = color(idx);
                serde_json::json!({
                    "label": dataset.label,
                    "data": dataset.values,
                    "backgroundColor": if kind == ChartKind::Line {
                        hex_to_rgba(base, 0.25)
                    } else {
                        base.to_string()
                    },
                    "borderColor": base,
                    "borderWidth": if kind == ChartKind::Line { 2 } else { 1 },
                    "fill": if kind == ChartKind::Line {
                        Value::Bool(false)
                    } else {
                        Value::String("origin".to_string())
                    },
                    "tension": if kind == ChartKind::Line { 0.35 } else { 0.0 },
                })
            }
        })
        .collect();

    let mut options = serde_json::json!({
        "responsive": true,
        "maintainAspectRatio": false,
        "plugins": {
            "legend": {"display": true, "position": "bottom"},
        },
    });
    if !kind.is_pie_like() {
        options["scales"] = serde_json::json!({
            "x": {"title": {"display": true, "text": data.dimension_key}},
            "y": {"beginAtZero": true},
        });
    }

    Some(ChartSpec {
        kind,
        data: serde_json::json!({
            "labels": data.labels,
            "datasets": datasets,
        }),
        options,
    })
}

// ---------------------------------------------------------------------------
// CSV export
// ---------------------------------------------------------------------------

/// The table's pre-built CSV when present, rebuilt with identical quoting
/// otherwise.
pub fn build_csv(table: &Table) -> String {
    if let Some(csv) = table.csv.as_deref() {
        if !csv.is_empty() {
            return csv.to_string();
        }
    }
    let headers = if table.headers.is_empty() {
        crate::extract::collect_headers(&table.rows)
    } else {
        table.headers.clone()
    };
    rows_to_csv(&table.rows, &headers)
}

/// Export artifact bytes: UTF-8 with a leading byte-order mark.
pub fn csv_export_bytes(table: &Table) -> Vec<u8> {
    let mut out = String::with_capacity(CSV_BOM.len() + 64);
    out.push_str(CSV_BOM);
    out.push_str(&build_csv(table));
    out.into_bytes()
}

/// Safe download filename derived from the table label.
pub fn csv_filename(label: &str) -> String {
    let stem: String = label
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "table.csv".to_string()
    } else {
        format!("{stem}.csv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table_with(rows: Vec<Value>, headers: &[&str], chart: Option<&str>) -> Table {
        Table {
            label: "sales".to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows,
            rows_truncated: false,
            total_rows: 0,
            csv: None,
            chart_type: chart.map(str::to_string),
            limit: None,
            max_rows: None,
        }
    }

    #[test]
    fn intent_families() {
        assert_eq!(normalize_chart_intent("column"), Some(ChartKind::Bar));
        assert_eq!(normalize_chart_intent("histogram"), Some(ChartKind::Bar));
        assert_eq!(normalize_chart_intent("PIE"), Some(ChartKind::Pie));
        assert_eq!(normalize_chart_intent("donut"), Some(ChartKind::Doughnut));
        assert_eq!(normalize_chart_intent("area"), Some(ChartKind::Line));
        assert_eq!(normalize_chart_intent("table"), None);
        assert_eq!(normalize_chart_intent("radar"), None);
        assert_eq!(normalize_chart_intent(""), None);
    }

    #[test]
    fn all_zero_dataset_yields_no_chart() {
        let t = table_with(
            vec![json!({"region": "A", "sales": 0}), json!({"region": "B", "sales": 0})],
            &["region", "sales"],
            Some("bar"),
        );
        assert!(build_datasets(&t, ChartKind::Bar).is_none());
    }

    #[test]
    fn partially_zero_dataset_is_retained() {
        let t = table_with(
            vec![json!({"region": "A", "sales": 10}), json!({"region": "B", "sales": 0})],
            &["region", "sales"],
            Some("bar"),
        );
        let data = build_datasets(&t, ChartKind::Bar).unwrap();
        assert_eq!(data.datasets.len(), 1);
        assert_eq!(data.datasets[0].values, vec![10.0, 0.0]);
        assert_eq!(data.dimension_key, "region");
        assert_eq!(data.labels, vec!["A", "B"]);
    }

    #[test]
    fn pie_takes_only_first_numeric_column() {
        let t = table_with(
            vec![
                json!({"region": "A", "q1": 5, "q2": 7}),
                json!({"region": "B", "q1": 3, "q2": 9}),
            ],
            &["region", "q1", "q2"],
            Some("pie"),
        );
        let data = build_datasets(&t, ChartKind::Pie).unwrap();
        assert_eq!(data.datasets.len(), 1);
        assert_eq!(data.datasets[0].key, "q1");

        let data = build_datasets(&t, ChartKind::Bar).unwrap();
        assert_eq!(data.datasets.len(), 2);
    }

    #[test]
    fn empty_dimension_labels_fall_back_to_position() {
        let t = table_with(
            vec![json!({"region": "", "sales": 4}), json!({"region": null, "sales": 2})],
            &["region", "sales"],
            None,
        );
        let data = build_datasets(&t, ChartKind::Bar).unwrap();
        assert_eq!(data.labels, vec!["item-1", "item-2"]);
    }

    #[test]
    fn array_rows_are_rekeyed_through_headers() {
        let t = table_with(
            vec![json!(["east", "31"]), json!(["west", "12"])],
            &["region", "count"],
            None,
        );
        let data = build_datasets(&t, ChartKind::Bar).unwrap();
        assert_eq!(data.labels, vec!["east", "west"]);
        assert_eq!(data.datasets[0].values, vec![31.0, 12.0]);
    }

    #[test]
    fn no_numeric_column_means_no_chart() {
        let t = table_with(
            vec![json!({"a": "x", "b": "y"})],
            &["a", "b"],
            Some("bar"),
        );
        assert!(build_datasets(&t, ChartKind::Bar).is_none());
    }

    #[test]
    fn palette_cycles() {
        assert_eq!(color(0), COLOR_PALETTE[0]);
        assert_eq!(color(10), COLOR_PALETTE[0]);
        assert_eq!(color(13), COLOR_PALETTE[3]);
    }

    #[test]
    fn hex_to_rgba_parses_palette_entries() {
        assert_eq!(hex_to_rgba("#ffffff", 0.25), "rgba(255, 255, 255, 0.25)");
        assert_eq!(hex_to_rgba("bogus", 0.5), "bogus");
    }

    #[test]
    fn chart_spec_requires_recognized_intent() {
        let rows = vec![json!({"region": "A", "sales": 10})];
        let t = table_with(rows.clone(), &["region", "sales"], Some("table"));
        assert!(build_chart_spec(&t).is_none());

        let t = table_with(rows, &["region", "sales"], Some("line"));
        let spec = build_chart_spec(&t).unwrap();
        assert_eq!(spec.kind, ChartKind::Line);
        assert_eq!(spec.data["labels"][0], "A");
        assert_eq!(spec.options["scales"]["x"]["title"]["text"], "region");
    }

    #[test]
    fn line_datasets_stay_unfilled_while_bars_fill_to_origin() {
        let rows = vec![json!({"region": "A", "sales": 10})];

        let line = table_with(rows.clone(), &["region", "sales"], Some("line"));
        let spec = build_chart_spec(&line).unwrap();
        let dataset = &spec.data["datasets"][0];
        assert_eq!(dataset["fill"], json!(false));
        assert_eq!(dataset["borderWidth"], 2);
        assert!(dataset["backgroundColor"]
            .as_str()
            .unwrap()
            .starts_with("rgba("));

        let bar = table_with(rows, &["region", "sales"], Some("bar"));
        let spec = build_chart_spec(&bar).unwrap();
        let dataset = &spec.data["datasets"][0];
        assert_eq!(dataset["fill"], json!("origin"));
        assert_eq!(dataset["borderWidth"], 1);
    }

    #[test]
    fn csv_prefers_prebuilt_string() {
        let mut t = table_with(vec![json!({"a": "1"})], &["a"], None);
        t.csv = Some("a\n1".to_string());
        assert_eq!(build_csv(&t), "a\n1");

        t.csv = None;
        assert_eq!(build_csv(&t), "a\n1");
    }

    #[test]
    fn export_bytes_start_with_bom() {
        let t = table_with(vec![json!({"a": "1"})], &["a"], None);
        let bytes = csv_export_bytes(&t);
        assert_eq!(&bytes[..3], &[0xef, 0xbb, 0xbf]);
    }

    #[test]
    fn export_filename_is_sanitized() {
        assert_eq!(csv_filename("result.data"), "result_data.csv");
        assert_eq!(csv_filename("  "), "table.csv");
    }
}
