use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dashboard aggregate over the reconciliation ledger. Computed fresh per
/// query; nothing here is cached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedSummary {
    pub imported_total: i64,
    pub unmatched_count: i64,
    pub proposed_count: i64,
    pub confirmed_count: i64,
    pub matched_amount_cents: i64,
    pub unmatched_amount_cents: i64,
    pub match_rate: f64,
    pub last_import_at: Option<DateTime<Utc>>,
    pub last_import_statement: Option<String>,
}

/// confirmed / total imported, 0.0 on an empty ledger.
pub fn match_rate(confirmed: i64, imported_total: i64) -> f64 {
    if imported_total == 0 {
        0.0
    } else {
        confirmed as f64 / imported_total as f64
    }
}
