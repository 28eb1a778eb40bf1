//! CSV export artifact assembly.

use tabula_core::models::Table;
use tabula_core::render;

/// A ready-to-save CSV artifact: UTF-8 bytes with a leading BOM so
/// spreadsheet tools detect the encoding, plus a filesystem-safe filename.
pub struct CsvExport {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Builds the download artifact for one table. The table's pre-built CSV is
/// reused when present so server and client emit identical bytes.
pub fn export_table(table: &Table) -> CsvExport {
    CsvExport {
        filename: render::csv_filename(&table.label),
        bytes: render::csv_export_bytes(table),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(label: &str, csv: Option<&str>) -> Table {
        Table {
            label: label.to_string(),
            headers: vec!["name".to_string()],
            rows: vec![json!({"name": "a,b"})],
            rows_truncated: false,
            total_rows: 1,
            csv: csv.map(str::to_string),
            chart_type: None,
            limit: None,
            max_rows: None,
        }
    }

    #[test]
    fn export_starts_with_a_bom_and_reuses_prebuilt_csv() {
        let out = export_table(&table("result", Some("name\nvalue")));
        assert!(out.bytes.starts_with("\u{feff}".as_bytes()));
        assert_eq!(&out.bytes["\u{feff}".len()..], b"name\nvalue");
    }

    #[test]
    fn export_rebuilds_csv_with_quoting_when_absent() {
        let out = export_table(&table("result", None));
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.contains("\"a,b\""));
    }

    #[test]
    fn filenames_are_filesystem_safe() {
        assert_eq!(export_table(&table("q3 revenue", None)).filename, "q3_revenue.csv");
        assert_eq!(export_table(&table("   ", None)).filename, "table.csv");
    }
}
