use serde::{Deserialize, Serialize};

/// A storage-safe tabular dataset attached to a bot message.
///
/// `rows` keeps the shape the extractor discovered: JSON objects keyed by
/// header, or plain JSON arrays for positional data. `total_rows` always
/// reflects the pre-truncation count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<serde_json::Value>,
    #[serde(default)]
    pub rows_truncated: bool,
    #[serde(default)]
    pub total_rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
}

/// Lossy projection of a [`Table`] carried when the full table is not
/// re-transmitted with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSummary {
    pub total_rows: usize,
}
