use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

use bancroft_core::{
    BankTransaction, FeedError, FeedSummary, LedgerRecordType, Match, MatchId, MatchStatus,
    RecordId, TransactionId, TxnState,
};
use bancroft_engine::MatchCandidate;
use bancroft_import::{derived_statement_ref, parse_statement, ImportError, RowError};
use bancroft_storage::{BulkOutcome, TransactionView, TxnFilter};

use crate::notify::{MatchEvent, Notifier};
use crate::AppState;

/// HTTP-facing wrapper over the domain error taxonomy. Parse and validation
/// problems are the client's to fix (422); duplicates and lost races are
/// conflicts (409, retryable flagged in the body); storage failures stay 500.
pub struct ApiError(FeedError);

impl From<FeedError> for ApiError {
    fn from(e: FeedError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FeedError::Parse { .. } | FeedError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FeedError::Duplicate(_) | FeedError::Conflict(_) => StatusCode::CONFLICT,
            FeedError::NotFound(_) => StatusCode::NOT_FOUND,
            FeedError::Storage(_) => {
                tracing::error!("storage failure: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    match bancroft_storage::ping(&state.db).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("health check failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy" })),
            )
                .into_response()
        }
    }
}

// ── upload ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub statement_ref: String,
    pub total_rows: usize,
    pub imported: usize,
    /// Line numbers already present from an earlier upload.
    pub skipped_duplicate: Vec<i64>,
    /// Every row that failed to parse, with its reason. Nothing is dropped
    /// silently.
    pub errors: Vec<RowError>,
}

pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut statement_ref: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| FeedError::Validation(format!("bad multipart body: {e}")))?
    {
        match field.name() {
            Some("file") => {
                let name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| FeedError::Validation(format!("failed to read upload: {e}")))?;
                file = Some((name, bytes.to_vec()));
            }
            Some("statement_ref") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| FeedError::Validation(format!("bad statement_ref: {e}")))?;
                if !value.trim().is_empty() {
                    statement_ref = Some(value.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let (filename, content) =
        file.ok_or_else(|| FeedError::Validation("missing 'file' field".to_string()))?;
    let statement_ref = statement_ref.unwrap_or_else(|| derived_statement_ref(&content));
    let file_hash = bancroft_import::content_hash(&content);

    let parsed = parse_statement(&content, &state.config.import.default_profile).map_err(
        |e| match e {
            ImportError::NoDataRows => {
                FeedError::Validation("statement contains no data rows".to_string())
            }
            other => FeedError::Validation(other.to_string()),
        },
    )?;

    let txns: Vec<BankTransaction> = parsed
        .rows
        .iter()
        .map(|r| BankTransaction {
            id: None,
            statement_ref: statement_ref.clone(),
            line_no: r.line_no,
            date: r.date,
            amount_cents: r.amount_cents,
            description: r.description.clone(),
            counterparty: r.counterparty.clone(),
            memo: r.memo.clone(),
            check_number: r.check_number.clone(),
            created_at: None,
        })
        .collect();

    let report = bancroft_storage::insert_transactions(&state.db, &txns).await?;

    bancroft_storage::record_statement(
        &state.db,
        &statement_ref,
        &filename,
        &file_hash,
        parsed.total_rows as i64,
        report.inserted.len() as i64,
        report.skipped_duplicate.len() as i64,
        parsed.errors.len() as i64,
        parsed.start_date,
        parsed.end_date,
    )
    .await?;

    tracing::info!(
        statement = %statement_ref,
        file = %filename,
        imported = report.inserted.len(),
        skipped = report.skipped_duplicate.len(),
        errored = parsed.errors.len(),
        "statement imported"
    );

    state
        .dispatcher
        .enqueue_matching(Some(statement_ref.clone()))
        .await;

    Ok(Json(UploadResponse {
        statement_ref,
        total_rows: parsed.total_rows,
        imported: report.inserted.len(),
        skipped_duplicate: report.skipped_duplicate,
        errors: parsed.errors,
    }))
}

// ── transactions ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub state: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub statement_ref: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<TransactionView>>, ApiError> {
    let txn_state = params
        .state
        .as_deref()
        .map(str::parse::<TxnState>)
        .transpose()?;

    let filter = TxnFilter {
        state: txn_state,
        date_from: params.from,
        date_to: params.to,
        statement_ref: params.statement_ref,
        limit: params.limit,
        offset: params.offset,
    };
    let views = bancroft_storage::list_transactions(&state.db, &filter).await?;
    Ok(Json(views))
}

#[derive(Debug, Serialize)]
pub struct TransactionDetail {
    pub transaction: BankTransaction,
    pub state: TxnState,
    pub active_match: Option<Match>,
    /// Scored against the current open-record pool; empty once a match is
    /// active.
    pub candidates: Vec<MatchCandidate>,
}

pub async fn transaction_detail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<TransactionDetail>, ApiError> {
    let id = TransactionId(id);
    let txn = bancroft_storage::get_transaction(&state.db, id)
        .await?
        .ok_or_else(|| FeedError::NotFound(format!("transaction {id}")))?;

    let active = bancroft_storage::active_match(&state.db, id).await?;
    let (txn_state, candidates) = match &active {
        Some(m) if m.status == MatchStatus::Confirmed => (TxnState::Confirmed, Vec::new()),
        Some(_) => (TxnState::Proposed, Vec::new()),
        None => {
            let pool = bancroft_storage::open_ledger_records(&state.db, None).await?;
            (TxnState::Unmatched, state.engine.find_candidates(&txn, &pool))
        }
    };

    Ok(Json(TransactionDetail {
        transaction: txn,
        state: txn_state,
        active_match: active,
        candidates,
    }))
}

// ── match lifecycle ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ManualMatchRequest {
    pub transaction_id: i64,
    pub record_type: LedgerRecordType,
    pub record_id: i64,
}

/// A user picking a record by hand is the strongest signal there is, so a
/// manual match lands directly in confirmed with full confidence.
pub async fn manual_match(
    State(state): State<AppState>,
    Json(req): Json<ManualMatchRequest>,
) -> Result<Json<Match>, ApiError> {
    let m = bancroft_storage::create_match(
        &state.db,
        TransactionId(req.transaction_id),
        req.record_type,
        RecordId(req.record_id),
        MatchStatus::Confirmed,
        1.0,
        true,
        None,
    )
    .await?;

    state.notifier.match_changed(MatchEvent {
        transaction_id: m.transaction_id,
        match_id: m.id,
        status: m.status,
    });
    Ok(Json(m))
}

pub async fn unmatch_transaction(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Match>, ApiError> {
    let id = TransactionId(id);
    let active = bancroft_storage::active_match(&state.db, id)
        .await?
        .ok_or_else(|| FeedError::NotFound(format!("active match for transaction {id}")))?;
    let match_id = active
        .id
        .ok_or_else(|| FeedError::Storage("match row without id".to_string()))?;

    let compensating = bancroft_storage::unmatch(&state.db, match_id).await?;

    state.notifier.match_changed(MatchEvent {
        transaction_id: id,
        match_id: compensating.id,
        status: MatchStatus::Rejected,
    });
    Ok(Json(compensating))
}

// ── bulk actions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Confirm,
    Reject,
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub action: BulkAction,
    /// Explicit match ids to act on.
    pub ids: Option<Vec<i64>>,
    /// Alternatively, act on all proposed matches relative to this
    /// confidence: confirm those at or above, reject those below.
    pub threshold: Option<f32>,
}

pub async fn bulk(
    State(state): State<AppState>,
    Json(req): Json<BulkRequest>,
) -> Result<Json<BulkOutcome>, ApiError> {
    let outcome = match (req.ids, req.threshold) {
        (Some(ids), _) => {
            let ids: Vec<MatchId> = ids.into_iter().map(MatchId).collect();
            let to = match req.action {
                BulkAction::Confirm => MatchStatus::Confirmed,
                BulkAction::Reject => MatchStatus::Rejected,
            };
            bancroft_storage::bulk_transition(&state.db, &ids, to).await?
        }
        (None, Some(threshold)) => match req.action {
            BulkAction::Confirm => {
                bancroft_storage::confirm_proposed_above(&state.db, threshold).await?
            }
            BulkAction::Reject => bancroft_storage::reject_below(&state.db, threshold).await?,
        },
        (None, None) => {
            return Err(FeedError::Validation("ids or threshold required".to_string()).into())
        }
    };

    for &id in &outcome.succeeded {
        if let Ok(Some(m)) = bancroft_storage::get_match(&state.db, id).await {
            state.notifier.match_changed(MatchEvent {
                transaction_id: m.transaction_id,
                match_id: m.id,
                status: m.status,
            });
        }
    }

    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
pub struct RematchRequest {
    pub statement_ref: Option<String>,
}

/// Explicitly request a matching pass. Transactions with an active match are
/// skipped; to truly re-evaluate one, unmatch or reject it first.
pub async fn rematch(
    State(state): State<AppState>,
    body: Option<Json<RematchRequest>>,
) -> StatusCode {
    let statement_ref = body.and_then(|Json(req)| req.statement_ref);
    state.dispatcher.enqueue_matching(statement_ref).await;
    StatusCode::ACCEPTED
}

// ── summary ──────────────────────────────────────────────────────────────────

pub async fn summary(State(state): State<AppState>) -> Result<Json<FeedSummary>, ApiError> {
    Ok(Json(bancroft_storage::summary(&state.db).await?))
}
