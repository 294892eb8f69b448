use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDate;
use std::io::Cursor;

use crate::csv::{parse_amount, parse_date};
use crate::{ImportError, ImportProfile, ParsedRow, ParsedStatement};

/// Parse an Excel (.xlsx / .xls) bank statement using the same column
/// profile as the CSV path. Only the first worksheet is read.
pub fn parse_xlsx(
    content: &[u8],
    profile: &ImportProfile,
) -> Result<ParsedStatement, ImportError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(content.to_vec()))
        .map_err(|e| ImportError::Excel(e.to_string()))?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ImportError::Excel("workbook has no sheets".to_string()))?
        .map_err(|e| ImportError::Excel(e.to_string()))?;

    let mut stmt = ParsedStatement::default();
    let mut line_no: i64 = 0;

    for row in range.rows().skip(profile.header_rows) {
        line_no += 1;
        stmt.total_rows += 1;
        let row_idx = line_no as usize;

        if row.iter().all(is_blank) {
            stmt.push_error(row_idx, "empty row");
            continue;
        }

        match parse_cells(row, profile, line_no) {
            Ok(parsed) => stmt.push_row(parsed),
            Err(reason) => stmt.push_error(row_idx, reason),
        }
    }

    if stmt.total_rows == 0 {
        return Err(ImportError::NoDataRows);
    }
    Ok(stmt)
}

fn parse_cells(row: &[Data], profile: &ImportProfile, line_no: i64) -> Result<ParsedRow, String> {
    let cell = |col: usize| row.get(col).unwrap_or(&Data::Empty);

    let date = cell_date(cell(profile.date_column), &profile.date_format)?;
    let description = cell_text(cell(profile.description_column))
        .ok_or_else(|| "empty description".to_string())?;

    let mut amount_cents = if let Some(col) = profile.amount_column {
        cell_amount(cell(col)).ok_or_else(|| "unparseable amount".to_string())?
    } else if let (Some(d_col), Some(c_col)) = (profile.debit_column, profile.credit_column) {
        match (cell_amount(cell(d_col)), cell_amount(cell(c_col))) {
            (Some(d), None) => d,
            (None, Some(c)) => -c,
            (None, None) => return Err("neither debit nor credit present".to_string()),
            (Some(_), Some(_)) => return Err("both debit and credit present".to_string()),
        }
    } else {
        return Err("profile maps no amount column".to_string());
    };
    if profile.flip_sign {
        amount_cents = -amount_cents;
    }

    let optional = |col: Option<usize>| col.and_then(|c| cell_text(cell(c)));

    Ok(ParsedRow {
        line_no,
        date,
        amount_cents,
        description,
        counterparty: optional(profile.counterparty_column),
        memo: optional(profile.memo_column),
        check_number: optional(profile.check_number_column),
    })
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Data::Empty => None,
        other => Some(other.to_string()),
    }
}

fn cell_date(cell: &Data, format: &str) -> Result<NaiveDate, String> {
    match cell {
        Data::Float(f) => excel_serial_to_date(*f),
        Data::Int(i) => excel_serial_to_date(*i as f64),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64()),
        Data::String(s) => parse_date(s, format),
        other => Err(format!("unparseable date cell '{other}'")),
    }
}

fn cell_amount(cell: &Data) -> Option<i64> {
    match cell {
        Data::Float(f) => Some((f * 100.0).round() as i64),
        Data::Int(i) => Some(i * 100),
        Data::String(s) => parse_amount(s).ok(),
        _ => None,
    }
}

/// Excel serial date → calendar date. The epoch is 1899-12-30, which absorbs
/// the spreadsheet 1900 leap-year bug. Serials outside 1900..≈2447 are
/// rejected as malformed cells rather than fed into date arithmetic.
const MAX_EXCEL_SERIAL: f64 = 200_000.0;

fn excel_serial_to_date(serial: f64) -> Result<NaiveDate, String> {
    if !serial.is_finite() || !(0.0..=MAX_EXCEL_SERIAL).contains(&serial) {
        return Err(format!("date serial out of range: {serial}"));
    }
    let base = NaiveDate::from_ymd_opt(1899, 12, 30).unwrap();
    Ok(base + chrono::Duration::days(serial as i64))
}
