use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::{ImportError, ImportProfile, ParsedRow, ParsedStatement};

/// Parse a CSV bank statement against a column profile. Fails per-row, not
/// per-file: malformed rows are reported in the result and skipped.
pub fn parse_csv(
    content: &[u8],
    profile: &ImportProfile,
) -> Result<ParsedStatement, ImportError> {
    let delimiter = profile.delimiter.as_bytes().first().copied().unwrap_or(b',');
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(content);

    let mut stmt = ParsedStatement::default();
    let mut line_no: i64 = 0;

    for result in reader.records().skip(profile.header_rows) {
        line_no += 1;
        stmt.total_rows += 1;
        let row_idx = line_no as usize;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                stmt.push_error(row_idx, e.to_string());
                continue;
            }
        };
        if record.iter().all(|f| f.trim().is_empty()) {
            stmt.push_error(row_idx, "empty row");
            continue;
        }

        match parse_record(&record, profile, line_no) {
            Ok(row) => stmt.push_row(row),
            Err(reason) => stmt.push_error(row_idx, reason),
        }
    }

    if stmt.total_rows == 0 {
        return Err(ImportError::NoDataRows);
    }
    Ok(stmt)
}

fn parse_record(
    record: &csv::StringRecord,
    profile: &ImportProfile,
    line_no: i64,
) -> Result<ParsedRow, String> {
    let field = |col: usize, name: &str| {
        record
            .get(col)
            .ok_or_else(|| format!("missing {name} column {col}"))
    };

    let date = parse_date(field(profile.date_column, "date")?, &profile.date_format)?;
    let description = field(profile.description_column, "description")?
        .trim()
        .to_string();
    if description.is_empty() {
        return Err("empty description".to_string());
    }

    let mut amount_cents = if let Some(col) = profile.amount_column {
        parse_amount(field(col, "amount")?)?
    } else if let (Some(d_col), Some(c_col)) = (profile.debit_column, profile.credit_column) {
        let debit = record
            .get(d_col)
            .filter(|s| !s.trim().is_empty())
            .map(parse_amount)
            .transpose()?;
        let credit = record
            .get(c_col)
            .filter(|s| !s.trim().is_empty())
            .map(parse_amount)
            .transpose()?;
        match (debit, credit) {
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

    let optional = |col: Option<usize>| {
        col.and_then(|c| record.get(c))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

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

pub(crate) fn parse_date(s: &str, format: &str) -> Result<NaiveDate, String> {
    let s = s.trim();

    if let Ok(date) = NaiveDate::parse_from_str(s, format) {
        return Ok(date);
    }

    // Common bank export formats, tried after the profile's own.
    for fmt in &[
        "%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%Y/%m/%d", "%m-%d-%Y", "%m/%d/%y",
    ] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(date);
        }
    }

    Err(format!("unparseable date '{s}'"))
}

pub(crate) fn parse_amount(s: &str) -> Result<i64, String> {
    let s = s.trim();
    let (negative, s) = if s.starts_with('(') && s.ends_with(')') {
        (true, &s[1..s.len() - 1])
    } else {
        (false, s)
    };
    let s = s.replace([',', '$', ' '], "");
    let mut dec = Decimal::from_str(&s).map_err(|_| format!("unparseable amount '{s}'"))?;
    if negative {
        dec = -dec;
    }
    (dec * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| format!("amount out of range '{s}'"))
}
