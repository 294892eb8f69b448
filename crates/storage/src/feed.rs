use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

use bancroft_core::summary::match_rate;
use bancroft_core::{
    check_transition, BankTransaction, FeedError, FeedSummary, LedgerRecordType, Match, MatchId,
    MatchStatus, OpenLedgerRecord, RecordId, TransactionId, TxnState,
};

use crate::db::DbPool;

fn db_err(e: sqlx::Error) -> FeedError {
    FeedError::Storage(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|d| d.is_unique_violation())
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|t| t.and_utc())
                .ok()
        })
}

fn parse_day(s: &str) -> Result<NaiveDate, FeedError> {
    s.parse()
        .map_err(|_| FeedError::Storage(format!("bad date in row: '{s}'")))
}

// ── statements & transactions ────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn record_statement(
    pool: &DbPool,
    statement_ref: &str,
    filename: &str,
    file_hash: &str,
    total_rows: i64,
    imported_rows: i64,
    skipped_rows: i64,
    errored_rows: i64,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
) -> Result<i64, FeedError> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO statements
            (statement_ref, filename, file_hash, total_rows, imported_rows,
             skipped_rows, errored_rows, start_date, end_date)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (statement_ref) DO UPDATE SET
            imported_rows = excluded.imported_rows,
            skipped_rows = excluded.skipped_rows,
            errored_rows = excluded.errored_rows
        RETURNING id
        "#,
    )
    .bind(statement_ref)
    .bind(filename)
    .bind(file_hash)
    .bind(total_rows)
    .bind(imported_rows)
    .bind(skipped_rows)
    .bind(errored_rows)
    .bind(start_date.map(|d| d.to_string()))
    .bind(end_date.map(|d| d.to_string()))
    .fetch_one(pool)
    .await
    .map_err(db_err)?;
    Ok(id)
}

/// Per-row insert result for one statement import.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InsertReport {
    pub inserted: Vec<TransactionId>,
    /// Line numbers whose natural key already existed.
    pub skipped_duplicate: Vec<i64>,
}

/// Insert a batch of parsed transactions. Duplicates (by natural key) are
/// skipped row by row, not rejected as a batch; the unique constraint is the
/// authority, so two importers racing on the same statement cannot
/// double-insert.
pub async fn insert_transactions(
    pool: &DbPool,
    txns: &[BankTransaction],
) -> Result<InsertReport, FeedError> {
    let mut report = InsertReport::default();

    for txn in txns {
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO bank_transactions
                (statement_ref, line_no, date, amount_cents, description,
                 counterparty, memo, check_number)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (statement_ref, line_no) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&txn.statement_ref)
        .bind(txn.line_no)
        .bind(txn.date.to_string())
        .bind(txn.amount_cents)
        .bind(&txn.description)
        .bind(&txn.counterparty)
        .bind(&txn.memo)
        .bind(&txn.check_number)
        .fetch_optional(pool)
        .await
        .map_err(db_err)?;

        match inserted {
            Some((id,)) => report.inserted.push(TransactionId(id)),
            None => {
                tracing::debug!("skipped: {}", FeedError::Duplicate(txn.natural_key()));
                report.skipped_duplicate.push(txn.line_no);
            }
        }
    }

    Ok(report)
}

type TxnRow = (
    i64,
    String,
    i64,
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

fn txn_from_row(r: TxnRow) -> Result<BankTransaction, FeedError> {
    Ok(BankTransaction {
        id: Some(TransactionId(r.0)),
        statement_ref: r.1,
        line_no: r.2,
        date: parse_day(&r.3)?,
        amount_cents: r.4,
        description: r.5,
        counterparty: r.6,
        memo: r.7,
        check_number: r.8,
        created_at: parse_ts(&r.9),
    })
}

const TXN_COLS: &str =
    "id, statement_ref, line_no, date, amount_cents, description, counterparty, memo, \
     check_number, created_at";

pub async fn get_transaction(
    pool: &DbPool,
    id: TransactionId,
) -> Result<Option<BankTransaction>, FeedError> {
    let row: Option<TxnRow> =
        sqlx::query_as(&format!("SELECT {TXN_COLS} FROM bank_transactions WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(pool)
            .await
            .map_err(db_err)?;
    row.map(txn_from_row).transpose()
}

/// Transactions without an active match, optionally limited to one
/// statement. The background matcher works off this set, which is what makes
/// re-running it a no-op for already-matched rows.
pub async fn unmatched_transactions(
    pool: &DbPool,
    statement_ref: Option<&str>,
) -> Result<Vec<BankTransaction>, FeedError> {
    let rows: Vec<TxnRow> = sqlx::query_as(&format!(
        r#"
        SELECT {TXN_COLS} FROM bank_transactions t
        WHERE NOT EXISTS (
            SELECT 1 FROM matches m
            WHERE m.transaction_id = t.id AND m.status IN ('proposed', 'confirmed')
        )
        AND (?1 IS NULL OR t.statement_ref = ?1)
        ORDER BY t.id
        "#
    ))
    .bind(statement_ref)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;
    rows.into_iter().map(txn_from_row).collect()
}

// ── ledger records ───────────────────────────────────────────────────────────

pub async fn insert_ledger_record(
    pool: &DbPool,
    record_type: LedgerRecordType,
    counterparty: &str,
    amount_cents: i64,
    date: NaiveDate,
    reference: Option<&str>,
) -> Result<RecordId, FeedError> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO ledger_records (record_type, counterparty, amount_cents, date, reference)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(record_type.to_string())
    .bind(counterparty)
    .bind(amount_cents)
    .bind(date.to_string())
    .bind(reference)
    .fetch_one(pool)
    .await
    .map_err(db_err)?;
    Ok(RecordId(id))
}

/// Open records eligible for matching. Records already holding an active
/// match are excluded here so the engine never proposes double-matching.
pub async fn open_ledger_records(
    pool: &DbPool,
    record_type: Option<LedgerRecordType>,
) -> Result<Vec<OpenLedgerRecord>, FeedError> {
    let rows: Vec<(i64, String, String, i64, String, Option<String>)> = sqlx::query_as(
        r#"
        SELECT id, record_type, counterparty, amount_cents, date, reference
        FROM ledger_records r
        WHERE r.is_open = 1
        AND NOT EXISTS (
            SELECT 1 FROM matches m
            WHERE m.record_type = r.record_type AND m.record_id = r.id
            AND m.status IN ('proposed', 'confirmed')
        )
        AND (?1 IS NULL OR r.record_type = ?1)
        ORDER BY r.id
        "#,
    )
    .bind(record_type.map(|t| t.to_string()))
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    rows.into_iter()
        .map(|r| {
            Ok(OpenLedgerRecord {
                id: RecordId(r.0),
                record_type: r.1.parse()?,
                counterparty: r.2,
                amount_cents: r.3,
                date: parse_day(&r.4)?,
                reference: r.5,
            })
        })
        .collect()
}

// ── matches ──────────────────────────────────────────────────────────────────

type MatchRow = (
    i64,
    i64,
    String,
    i64,
    String,
    f64,
    i64,
    Option<i64>,
    i64,
    String,
    String,
);

fn match_from_row(r: MatchRow) -> Result<Match, FeedError> {
    Ok(Match {
        id: Some(MatchId(r.0)),
        transaction_id: TransactionId(r.1),
        record_type: r.2.parse()?,
        record_id: RecordId(r.3),
        status: r.4.parse()?,
        confidence: r.5 as f32,
        user_override: r.6 != 0,
        supersedes: r.7.map(MatchId),
        version: r.8,
        created_at: parse_ts(&r.9),
        updated_at: parse_ts(&r.10),
    })
}

const MATCH_COLS: &str =
    "id, transaction_id, record_type, record_id, status, confidence, user_override, \
     supersedes, version, created_at, updated_at";

pub async fn get_match(pool: &DbPool, id: MatchId) -> Result<Option<Match>, FeedError> {
    let row: Option<MatchRow> =
        sqlx::query_as(&format!("SELECT {MATCH_COLS} FROM matches WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(pool)
            .await
            .map_err(db_err)?;
    row.map(match_from_row).transpose()
}

pub async fn active_match(
    pool: &DbPool,
    transaction_id: TransactionId,
) -> Result<Option<Match>, FeedError> {
    let row: Option<MatchRow> = sqlx::query_as(&format!(
        "SELECT {MATCH_COLS} FROM matches \
         WHERE transaction_id = ? AND status IN ('proposed', 'confirmed')"
    ))
    .bind(transaction_id.0)
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;
    row.map(match_from_row).transpose()
}

/// Create a match row. The transaction must exist and carry no active match;
/// the partial unique indexes back both checks against concurrent writers.
#[allow(clippy::too_many_arguments)]
pub async fn create_match(
    pool: &DbPool,
    transaction_id: TransactionId,
    record_type: LedgerRecordType,
    record_id: RecordId,
    status: MatchStatus,
    confidence: f32,
    user_override: bool,
    supersedes: Option<MatchId>,
) -> Result<Match, FeedError> {
    if get_transaction(pool, transaction_id).await?.is_none() {
        return Err(FeedError::NotFound(format!(
            "transaction {transaction_id}"
        )));
    }
    if status.is_active() {
        if let Some(existing) = active_match(pool, transaction_id).await? {
            return Err(FeedError::Validation(format!(
                "transaction {transaction_id} already matched (match {})",
                existing.id.map(|m| m.0).unwrap_or_default()
            )));
        }
    }

    let row: MatchRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO matches
            (transaction_id, record_type, record_id, status, confidence,
             user_override, supersedes)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING {MATCH_COLS}
        "#
    ))
    .bind(transaction_id.0)
    .bind(record_type.to_string())
    .bind(record_id.0)
    .bind(status.to_string())
    .bind(confidence as f64)
    .bind(user_override)
    .bind(supersedes.map(|m| m.0))
    .fetch_one(pool)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            FeedError::Conflict(format!(
                "active match raced for transaction {transaction_id} or record \
                 {record_type}/{record_id}"
            ))
        } else {
            db_err(e)
        }
    })?;

    match_from_row(row)
}

pub async fn propose_match(
    pool: &DbPool,
    transaction_id: TransactionId,
    record_type: LedgerRecordType,
    record_id: RecordId,
    confidence: f32,
) -> Result<Match, FeedError> {
    create_match(
        pool,
        transaction_id,
        record_type,
        record_id,
        MatchStatus::Proposed,
        confidence,
        false,
        None,
    )
    .await
}

/// Single-row state transition with an explicit version check, for callers
/// that carry a version from an earlier read. Zero rows touched while the
/// row still exists means someone else moved it first: `Conflict`, retryable.
pub async fn transition_match_versioned(
    pool: &DbPool,
    id: MatchId,
    to: MatchStatus,
    via_unmatch: bool,
    expected_version: i64,
) -> Result<Match, FeedError> {
    let current = get_match(pool, id)
        .await?
        .ok_or_else(|| FeedError::NotFound(format!("match {id}")))?;
    check_transition(current.status, to, via_unmatch)?;

    let result = sqlx::query(
        "UPDATE matches SET status = ?, version = version + 1, \
         updated_at = datetime('now') WHERE id = ? AND version = ?",
    )
    .bind(to.to_string())
    .bind(id.0)
    .bind(expected_version)
    .execute(pool)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(FeedError::Conflict(format!(
            "match {id} changed concurrently (expected version {expected_version})"
        )));
    }

    get_match(pool, id)
        .await?
        .ok_or_else(|| FeedError::NotFound(format!("match {id}")))
}

pub async fn transition_match(
    pool: &DbPool,
    id: MatchId,
    to: MatchStatus,
    via_unmatch: bool,
) -> Result<Match, FeedError> {
    let current = get_match(pool, id)
        .await?
        .ok_or_else(|| FeedError::NotFound(format!("match {id}")))?;
    transition_match_versioned(pool, id, to, via_unmatch, current.version).await
}

pub async fn confirm_match(pool: &DbPool, id: MatchId) -> Result<Match, FeedError> {
    transition_match(pool, id, MatchStatus::Confirmed, false).await
}

pub async fn reject_match(pool: &DbPool, id: MatchId) -> Result<Match, FeedError> {
    transition_match(pool, id, MatchStatus::Rejected, false).await
}

/// Undo a confirmed match. The original row transitions to rejected and a
/// compensating rejected row is written in the same database transaction,
/// so the audit trail shows both the confirmation and its reversal. The
/// transaction becomes eligible for re-matching.
pub async fn unmatch(pool: &DbPool, id: MatchId) -> Result<Match, FeedError> {
    let original = get_match(pool, id)
        .await?
        .ok_or_else(|| FeedError::NotFound(format!("match {id}")))?;
    if original.status != MatchStatus::Confirmed {
        return Err(FeedError::Validation(format!(
            "unmatch applies to confirmed matches; match {id} is {}",
            original.status
        )));
    }

    let mut tx = pool.begin().await.map_err(db_err)?;

    let result = sqlx::query(
        "UPDATE matches SET status = 'rejected', version = version + 1, \
         updated_at = datetime('now') WHERE id = ? AND version = ?",
    )
    .bind(id.0)
    .bind(original.version)
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;

    if result.rows_affected() == 0 {
        return Err(FeedError::Conflict(format!(
            "match {id} changed concurrently during unmatch"
        )));
    }

    let row: MatchRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO matches
            (transaction_id, record_type, record_id, status, confidence,
             user_override, supersedes)
        VALUES (?, ?, ?, 'rejected', ?, 1, ?)
        RETURNING {MATCH_COLS}
        "#
    ))
    .bind(original.transaction_id.0)
    .bind(original.record_type.to_string())
    .bind(original.record_id.0)
    .bind(original.confidence as f64)
    .bind(id.0)
    .fetch_one(&mut *tx)
    .await
    .map_err(db_err)?;

    tx.commit().await.map_err(db_err)?;
    match_from_row(row)
}

// ── bulk actions ─────────────────────────────────────────────────────────────

/// Aggregate outcome of a bulk action. Records are processed independently:
/// a failure is reported here, never rolled into the others.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<MatchId>,
    pub failed: Vec<(MatchId, String)>,
}

pub async fn bulk_transition(
    pool: &DbPool,
    ids: &[MatchId],
    to: MatchStatus,
) -> Result<BulkOutcome, FeedError> {
    let mut outcome = BulkOutcome::default();
    for &id in ids {
        match transition_match(pool, id, to, false).await {
            Ok(_) => outcome.succeeded.push(id),
            Err(e) => outcome.failed.push((id, e.to_string())),
        }
    }
    Ok(outcome)
}

async fn proposed_ids_where(
    pool: &DbPool,
    comparison: &str,
    threshold: f32,
) -> Result<Vec<MatchId>, FeedError> {
    let rows: Vec<(i64,)> = sqlx::query_as(&format!(
        "SELECT id FROM matches WHERE status = 'proposed' AND confidence {comparison} ? ORDER BY id"
    ))
    .bind(threshold as f64)
    .fetch_all(pool)
    .await
    .map_err(db_err)?;
    Ok(rows.into_iter().map(|(id,)| MatchId(id)).collect())
}

pub async fn confirm_proposed_above(
    pool: &DbPool,
    threshold: f32,
) -> Result<BulkOutcome, FeedError> {
    let ids = proposed_ids_where(pool, ">=", threshold).await?;
    bulk_transition(pool, &ids, MatchStatus::Confirmed).await
}

pub async fn reject_below(pool: &DbPool, threshold: f32) -> Result<BulkOutcome, FeedError> {
    let ids = proposed_ids_where(pool, "<", threshold).await?;
    bulk_transition(pool, &ids, MatchStatus::Rejected).await
}

// ── queries for the HTTP surface ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct MatchedEntity {
    pub match_id: MatchId,
    pub record_type: LedgerRecordType,
    pub record_id: RecordId,
    pub status: MatchStatus,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionView {
    #[serde(flatten)]
    pub transaction: BankTransaction,
    pub state: TxnState,
    pub matched: Option<MatchedEntity>,
}

#[derive(Debug, Clone, Default)]
pub struct TxnFilter {
    pub state: Option<TxnState>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub statement_ref: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_transactions(
    pool: &DbPool,
    filter: &TxnFilter,
) -> Result<Vec<TransactionView>, FeedError> {
    let state_clause = match filter.state {
        None => "",
        Some(TxnState::Unmatched) => " AND m.id IS NULL",
        Some(TxnState::Proposed) => " AND m.status = 'proposed'",
        Some(TxnState::Confirmed) => " AND m.status = 'confirmed'",
    };

    #[allow(clippy::type_complexity)]
    let rows: Vec<(
        i64,
        String,
        i64,
        String,
        i64,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
        Option<i64>,
        Option<String>,
        Option<i64>,
        Option<String>,
        Option<f64>,
    )> = sqlx::query_as(&format!(
        r#"
        SELECT t.id, t.statement_ref, t.line_no, t.date, t.amount_cents,
               t.description, t.counterparty, t.memo, t.check_number, t.created_at,
               m.id, m.record_type, m.record_id, m.status, m.confidence
        FROM bank_transactions t
        LEFT JOIN matches m
            ON m.transaction_id = t.id AND m.status IN ('proposed', 'confirmed')
        WHERE (?1 IS NULL OR t.date >= ?1)
          AND (?2 IS NULL OR t.date <= ?2)
          AND (?3 IS NULL OR t.statement_ref = ?3){state_clause}
        ORDER BY t.date DESC, t.id DESC
        LIMIT ?4 OFFSET ?5
        "#
    ))
    .bind(filter.date_from.map(|d| d.to_string()))
    .bind(filter.date_to.map(|d| d.to_string()))
    .bind(&filter.statement_ref)
    .bind(filter.limit.unwrap_or(50))
    .bind(filter.offset.unwrap_or(0))
    .fetch_all(pool)
    .await
    .map_err(db_err)?;

    rows.into_iter()
        .map(|r| {
            let transaction = txn_from_row((
                r.0, r.1, r.2, r.3, r.4, r.5, r.6, r.7, r.8, r.9,
            ))?;
            let matched = match (r.10, r.11, r.12, r.13, r.14) {
                (Some(mid), Some(rt), Some(rid), Some(st), conf) => Some(MatchedEntity {
                    match_id: MatchId(mid),
                    record_type: rt.parse()?,
                    record_id: RecordId(rid),
                    status: st.parse()?,
                    confidence: conf.unwrap_or(0.0) as f32,
                }),
                _ => None,
            };
            let state = match matched.as_ref().map(|m| m.status) {
                Some(MatchStatus::Confirmed) => TxnState::Confirmed,
                Some(_) => TxnState::Proposed,
                None => TxnState::Unmatched,
            };
            Ok(TransactionView {
                transaction,
                state,
                matched,
            })
        })
        .collect()
}

// ── summary aggregation ──────────────────────────────────────────────────────

/// One query over the ledger as it stands right now; nothing cached.
pub async fn summary(pool: &DbPool) -> Result<FeedSummary, FeedError> {
    let (total, confirmed, proposed, unmatched, matched_cents, unmatched_cents): (
        i64,
        i64,
        i64,
        i64,
        i64,
        i64,
    ) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               COALESCE(SUM(CASE WHEN m.status = 'confirmed' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN m.status = 'proposed' THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN m.id IS NULL THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN m.status = 'confirmed' THEN t.amount_cents ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN m.id IS NULL THEN t.amount_cents ELSE 0 END), 0)
        FROM bank_transactions t
        LEFT JOIN matches m
            ON m.transaction_id = t.id AND m.status IN ('proposed', 'confirmed')
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(db_err)?;

    let last: Option<(String, String)> = sqlx::query_as(
        "SELECT statement_ref, created_at FROM statements ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;

    Ok(FeedSummary {
        imported_total: total,
        unmatched_count: unmatched,
        proposed_count: proposed,
        confirmed_count: confirmed,
        matched_amount_cents: matched_cents,
        unmatched_amount_cents: unmatched_cents,
        match_rate: match_rate(confirmed, total),
        last_import_at: last.as_ref().and_then(|(_, ts)| parse_ts(ts)),
        last_import_statement: last.map(|(s, _)| s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_db;
    use tempfile::TempDir;

    async fn setup() -> (DbPool, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("feed.db")).await.unwrap();
        (pool, dir)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn txn(line_no: i64, amount: i64, desc: &str) -> BankTransaction {
        BankTransaction {
            id: None,
            statement_ref: "stmt-1".to_string(),
            line_no,
            date: day(2024, 3, 1),
            amount_cents: amount,
            description: desc.to_string(),
            counterparty: None,
            memo: None,
            check_number: None,
            created_at: None,
        }
    }

    async fn seed_txn(pool: &DbPool, line_no: i64, amount: i64) -> TransactionId {
        insert_transactions(pool, &[txn(line_no, amount, "SEED ROW")])
            .await
            .unwrap()
            .inserted[0]
    }

    async fn seed_record(pool: &DbPool, amount: i64, vendor: &str) -> RecordId {
        insert_ledger_record(
            pool,
            LedgerRecordType::Ap,
            vendor,
            amount,
            day(2024, 3, 2),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn importing_same_rows_twice_inserts_nothing_new() {
        let (pool, _dir) = setup().await;
        let batch = vec![txn(1, -15000, "ACME"), txn(2, 2500, "DEPOSIT")];

        let first = insert_transactions(&pool, &batch).await.unwrap();
        assert_eq!(first.inserted.len(), 2);
        assert!(first.skipped_duplicate.is_empty());

        let second = insert_transactions(&pool, &batch).await.unwrap();
        assert!(second.inserted.is_empty());
        assert_eq!(second.skipped_duplicate, vec![1, 2]);
    }

    #[tokio::test]
    async fn one_active_match_per_transaction() {
        let (pool, _dir) = setup().await;
        let t = seed_txn(&pool, 1, -15000).await;
        let r1 = seed_record(&pool, -15000, "ACME").await;
        let r2 = seed_record(&pool, -15000, "ACME TOO").await;

        propose_match(&pool, t, LedgerRecordType::Ap, r1, 0.8)
            .await
            .unwrap();
        let err = propose_match(&pool, t, LedgerRecordType::Ap, r2, 0.7)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
    }

    #[tokio::test]
    async fn record_side_double_match_is_a_conflict() {
        let (pool, _dir) = setup().await;
        let t1 = seed_txn(&pool, 1, -15000).await;
        let t2 = seed_txn(&pool, 2, -15000).await;
        let r = seed_record(&pool, -15000, "ACME").await;

        propose_match(&pool, t1, LedgerRecordType::Ap, r, 0.8)
            .await
            .unwrap();
        // t2 has no active match, so the application pre-check passes and the
        // record-side unique index is what stops the double-match.
        let err = propose_match(&pool, t2, LedgerRecordType::Ap, r, 0.8)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Conflict(_)));
    }

    #[tokio::test]
    async fn matched_record_leaves_the_candidate_pool() {
        let (pool, _dir) = setup().await;
        let t = seed_txn(&pool, 1, -15000).await;
        let r1 = seed_record(&pool, -15000, "ACME").await;
        let r2 = seed_record(&pool, -9000, "OTHER").await;

        assert_eq!(open_ledger_records(&pool, None).await.unwrap().len(), 2);
        propose_match(&pool, t, LedgerRecordType::Ap, r1, 0.9)
            .await
            .unwrap();
        let open = open_ledger_records(&pool, None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, r2);
    }

    #[tokio::test]
    async fn transition_rules_are_enforced() {
        let (pool, _dir) = setup().await;
        let t = seed_txn(&pool, 1, -15000).await;
        let r = seed_record(&pool, -15000, "ACME").await;
        let m = propose_match(&pool, t, LedgerRecordType::Ap, r, 0.8)
            .await
            .unwrap();
        let id = m.id.unwrap();

        let confirmed = confirm_match(&pool, id).await.unwrap();
        assert_eq!(confirmed.status, MatchStatus::Confirmed);
        assert_eq!(confirmed.version, 2);

        // Confirmed cannot be rejected outside the unmatch path.
        let err = reject_match(&pool, id).await.unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
    }

    #[tokio::test]
    async fn stale_version_surfaces_as_conflict() {
        let (pool, _dir) = setup().await;
        let t = seed_txn(&pool, 1, -15000).await;
        let r = seed_record(&pool, -15000, "ACME").await;
        let m = propose_match(&pool, t, LedgerRecordType::Ap, r, 0.8)
            .await
            .unwrap();

        let err = transition_match_versioned(
            &pool,
            m.id.unwrap(),
            MatchStatus::Confirmed,
            false,
            m.version + 1,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FeedError::Conflict(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unmatch_compensates_and_frees_the_transaction() {
        let (pool, _dir) = setup().await;
        let t = seed_txn(&pool, 1, -15000).await;
        let r1 = seed_record(&pool, -15000, "ACME").await;
        let r2 = seed_record(&pool, -15000, "ACME CORRECTED").await;
        let m = propose_match(&pool, t, LedgerRecordType::Ap, r1, 0.9)
            .await
            .unwrap();
        let id = m.id.unwrap();
        confirm_match(&pool, id).await.unwrap();

        let compensating = unmatch(&pool, id).await.unwrap();
        assert_eq!(compensating.status, MatchStatus::Rejected);
        assert!(compensating.user_override);
        assert_eq!(compensating.supersedes, Some(id));

        // Original row is still there, transitioned but not overwritten.
        let original = get_match(&pool, id).await.unwrap().unwrap();
        assert_eq!(original.status, MatchStatus::Rejected);
        assert_eq!(original.record_id, r1);

        // Transaction can be matched again.
        assert!(active_match(&pool, t).await.unwrap().is_none());
        propose_match(&pool, t, LedgerRecordType::Ap, r2, 0.9)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unmatch_on_proposed_is_invalid() {
        let (pool, _dir) = setup().await;
        let t = seed_txn(&pool, 1, -15000).await;
        let r = seed_record(&pool, -15000, "ACME").await;
        let m = propose_match(&pool, t, LedgerRecordType::Ap, r, 0.9)
            .await
            .unwrap();
        let err = unmatch(&pool, m.id.unwrap()).await.unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
    }

    #[tokio::test]
    async fn bulk_action_keeps_going_past_a_failure() {
        let (pool, _dir) = setup().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let t = seed_txn(&pool, i + 1, -1000 * (i + 1)).await;
            let r = seed_record(&pool, -1000 * (i + 1), "VENDOR").await;
            let m = propose_match(&pool, t, LedgerRecordType::Ap, r, 0.8)
                .await
                .unwrap();
            ids.push(m.id.unwrap());
        }
        // Pre-reject one so confirming it later fails validation.
        reject_match(&pool, ids[2]).await.unwrap();

        let outcome = bulk_transition(&pool, &ids, MatchStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(outcome.succeeded.len(), 4);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, ids[2]);
        assert!(outcome.failed[0].1.contains("invalid transition"));

        // The four others really committed.
        for id in outcome.succeeded {
            let m = get_match(&pool, id).await.unwrap().unwrap();
            assert_eq!(m.status, MatchStatus::Confirmed);
        }
    }

    #[tokio::test]
    async fn threshold_bulk_actions_select_by_confidence() {
        let (pool, _dir) = setup().await;
        let mut high = None;
        let mut low = None;
        for (i, conf) in [(1, 0.92_f32), (2, 0.40_f32)] {
            let t = seed_txn(&pool, i, -1000 * i).await;
            let r = seed_record(&pool, -1000 * i, "VENDOR").await;
            let m = propose_match(&pool, t, LedgerRecordType::Ap, r, conf)
                .await
                .unwrap();
            if i == 1 {
                high = m.id;
            } else {
                low = m.id;
            }
        }

        let confirmed = confirm_proposed_above(&pool, 0.75).await.unwrap();
        assert_eq!(confirmed.succeeded, vec![high.unwrap()]);

        let rejected = reject_below(&pool, 0.75).await.unwrap();
        assert_eq!(rejected.succeeded, vec![low.unwrap()]);
    }

    #[tokio::test]
    async fn unmatched_transactions_skips_active_matches() {
        let (pool, _dir) = setup().await;
        let t1 = seed_txn(&pool, 1, -100).await;
        let _t2 = seed_txn(&pool, 2, -200).await;
        let r = seed_record(&pool, -100, "ACME").await;
        propose_match(&pool, t1, LedgerRecordType::Ap, r, 0.9)
            .await
            .unwrap();

        let open = unmatched_transactions(&pool, None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].line_no, 2);
    }

    #[tokio::test]
    async fn list_transactions_filters_by_state() {
        let (pool, _dir) = setup().await;
        let t1 = seed_txn(&pool, 1, -100).await;
        let _t2 = seed_txn(&pool, 2, -200).await;
        let r = seed_record(&pool, -100, "ACME").await;
        let m = propose_match(&pool, t1, LedgerRecordType::Ap, r, 0.9)
            .await
            .unwrap();
        confirm_match(&pool, m.id.unwrap()).await.unwrap();

        let confirmed = list_transactions(
            &pool,
            &TxnFilter {
                state: Some(TxnState::Confirmed),
                ..TxnFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].transaction.id, Some(t1));
        assert_eq!(
            confirmed[0].matched.as_ref().unwrap().status,
            MatchStatus::Confirmed
        );

        let unmatched = list_transactions(
            &pool,
            &TxnFilter {
                state: Some(TxnState::Unmatched),
                ..TxnFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].state, TxnState::Unmatched);
    }

    #[tokio::test]
    async fn summary_reflects_ledger_state() {
        let (pool, _dir) = setup().await;
        record_statement(
            &pool,
            "stmt-1",
            "march.csv",
            "deadbeef",
            3,
            3,
            0,
            0,
            Some(day(2024, 3, 1)),
            Some(day(2024, 3, 3)),
        )
        .await
        .unwrap();

        let t1 = seed_txn(&pool, 1, -15000).await;
        let t2 = seed_txn(&pool, 2, -4000).await;
        let _t3 = seed_txn(&pool, 3, 2500).await;
        let r1 = seed_record(&pool, -15000, "ACME").await;
        let r2 = seed_record(&pool, -4000, "GRID").await;

        let m1 = propose_match(&pool, t1, LedgerRecordType::Ap, r1, 0.94)
            .await
            .unwrap();
        confirm_match(&pool, m1.id.unwrap()).await.unwrap();
        propose_match(&pool, t2, LedgerRecordType::Expense, r2, 0.6)
            .await
            .unwrap();

        let s = summary(&pool).await.unwrap();
        assert_eq!(s.imported_total, 3);
        assert_eq!(s.confirmed_count, 1);
        assert_eq!(s.proposed_count, 1);
        assert_eq!(s.unmatched_count, 1);
        assert_eq!(s.matched_amount_cents, -15000);
        assert_eq!(s.unmatched_amount_cents, 2500);
        assert!((s.match_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.last_import_statement.as_deref(), Some("stmt-1"));
    }
}
