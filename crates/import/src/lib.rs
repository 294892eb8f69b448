pub mod csv;
pub mod xlsx;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use crate::csv::parse_csv;
pub use crate::xlsx::parse_xlsx;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] ::csv::Error),
    #[error("Excel error: {0}")]
    Excel(String),
    #[error("No data rows")]
    NoDataRows,
}

/// Column mapping and parse options for one bank's export format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportProfile {
    pub date_column: usize,
    pub description_column: usize,
    pub counterparty_column: Option<usize>,
    pub amount_column: Option<usize>,
    pub debit_column: Option<usize>,
    pub credit_column: Option<usize>,
    pub memo_column: Option<usize>,
    pub check_number_column: Option<usize>,
    pub date_format: String,
    /// Rows to skip before data begins (header plus any preamble).
    pub header_rows: usize,
    /// Invert the sign convention of the amount column.
    pub flip_sign: bool,
    pub delimiter: String,
}

impl Default for ImportProfile {
    fn default() -> Self {
        Self {
            date_column: 0,
            description_column: 1,
            counterparty_column: None,
            amount_column: Some(2),
            debit_column: None,
            credit_column: None,
            memo_column: None,
            check_number_column: None,
            date_format: "%Y-%m-%d".to_string(),
            header_rows: 1,
            flip_sign: false,
            delimiter: ",".to_string(),
        }
    }
}

/// One successfully parsed data row. `line_no` is the 1-based position among
/// data rows and, together with the statement reference, forms the natural
/// key that dedupes re-imports.
#[derive(Debug, Clone)]
pub struct ParsedRow {
    pub line_no: i64,
    pub date: NaiveDate,
    pub amount_cents: i64,
    pub description: String,
    pub counterparty: Option<String>,
    pub memo: Option<String>,
    pub check_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    pub reason: String,
}

/// Parse output: rows that made it, rows that did not, and the statement
/// date range. A malformed row lands in `errors` and never aborts the file.
#[derive(Debug, Default)]
pub struct ParsedStatement {
    pub rows: Vec<ParsedRow>,
    pub errors: Vec<RowError>,
    pub total_rows: usize,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl ParsedStatement {
    pub(crate) fn push_row(&mut self, row: ParsedRow) {
        match self.start_date {
            Some(d) if d <= row.date => {}
            _ => self.start_date = Some(row.date),
        }
        match self.end_date {
            Some(d) if d >= row.date => {}
            _ => self.end_date = Some(row.date),
        }
        self.rows.push(row);
    }

    pub(crate) fn push_error(&mut self, row: usize, reason: impl Into<String>) {
        self.errors.push(RowError {
            row,
            reason: reason.into(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementFormat {
    Csv,
    Excel,
}

/// Sniff the upload by magic bytes: XLSX is ZIP-based (`PK`), legacy XLS is
/// an OLE2 compound file; anything else is treated as CSV.
pub fn detect_format(content: &[u8]) -> StatementFormat {
    if content.starts_with(b"PK") || content.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
        StatementFormat::Excel
    } else {
        StatementFormat::Csv
    }
}

/// Full SHA-256 of the uploaded file, hex-encoded.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Statement reference derived from content when the caller supplies none.
/// Re-uploading the identical file yields identical natural keys, so the
/// whole statement dedupes at the unique constraint.
pub fn derived_statement_ref(content: &[u8]) -> String {
    content_hash(content)[..12].to_string()
}

/// Dispatch on sniffed format.
pub fn parse_statement(
    content: &[u8],
    profile: &ImportProfile,
) -> Result<ParsedStatement, ImportError> {
    match detect_format(content) {
        StatementFormat::Excel => parse_xlsx(content, profile),
        StatementFormat::Csv => parse_csv(content, profile),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_format_zip_magic_is_excel() {
        assert_eq!(detect_format(b"PK\x03\x04rest"), StatementFormat::Excel);
    }

    #[test]
    fn detect_format_ole2_magic_is_excel() {
        assert_eq!(
            detect_format(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1]),
            StatementFormat::Excel
        );
    }

    #[test]
    fn detect_format_text_is_csv() {
        assert_eq!(
            detect_format(b"date,description,amount\n"),
            StatementFormat::Csv
        );
    }

    #[test]
    fn derived_ref_is_stable_and_short() {
        let a = derived_statement_ref(b"same bytes");
        let b = derived_statement_ref(b"same bytes");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_ne!(a, derived_statement_ref(b"other bytes"));
    }

    #[test]
    fn date_range_tracks_min_and_max() {
        let mut stmt = ParsedStatement::default();
        let mk = |d: u32| ParsedRow {
            line_no: d as i64,
            date: chrono::NaiveDate::from_ymd_opt(2024, 3, d).unwrap(),
            amount_cents: 0,
            description: String::new(),
            counterparty: None,
            memo: None,
            check_number: None,
        };
        stmt.push_row(mk(10));
        stmt.push_row(mk(2));
        stmt.push_row(mk(21));
        assert_eq!(stmt.start_date.unwrap().to_string(), "2024-03-02");
        assert_eq!(stmt.end_date.unwrap().to_string(), "2024-03-21");
    }
}
