use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::FeedError;
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Domain-derived unique identifier for an imported row: source statement
/// plus line number. The storage layer enforces uniqueness on this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub statement_ref: String,
    pub line_no: i64,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.statement_ref, self.line_no)
    }
}

/// A bank-feed row. Immutable once imported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankTransaction {
    pub id: Option<TransactionId>,
    pub statement_ref: String,
    pub line_no: i64,
    pub date: NaiveDate,
    pub amount_cents: i64,
    pub description: String,
    pub counterparty: Option<String>,
    pub memo: Option<String>,
    pub check_number: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl BankTransaction {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            statement_ref: self.statement_ref.clone(),
            line_no: self.line_no,
        }
    }

    pub fn amount(&self) -> Money {
        Money::from_cents(self.amount_cents)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerRecordType {
    Ap,
    Ar,
    Expense,
}

impl fmt::Display for LedgerRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerRecordType::Ap => write!(f, "ap"),
            LedgerRecordType::Ar => write!(f, "ar"),
            LedgerRecordType::Expense => write!(f, "expense"),
        }
    }
}

impl FromStr for LedgerRecordType {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ap" => Ok(LedgerRecordType::Ap),
            "ar" => Ok(LedgerRecordType::Ar),
            "expense" => Ok(LedgerRecordType::Expense),
            other => Err(FeedError::Validation(format!(
                "unknown record type '{other}'"
            ))),
        }
    }
}

/// An open AP bill, AR invoice, or expense entry eligible for matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenLedgerRecord {
    pub id: RecordId,
    pub record_type: LedgerRecordType,
    pub counterparty: String,
    pub amount_cents: i64,
    pub date: NaiveDate,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Proposed,
    Confirmed,
    Rejected,
}

impl MatchStatus {
    /// Active matches block re-matching of the transaction and keep the
    /// paired ledger record out of candidate pools.
    pub fn is_active(self) -> bool {
        matches!(self, MatchStatus::Proposed | MatchStatus::Confirmed)
    }

    /// The only legal mutations of a match row. A confirmed match moves to
    /// rejected solely through the unmatch operation.
    pub fn can_transition(self, to: MatchStatus, via_unmatch: bool) -> bool {
        match (self, to) {
            (MatchStatus::Proposed, MatchStatus::Confirmed) => true,
            (MatchStatus::Proposed, MatchStatus::Rejected) => true,
            (MatchStatus::Confirmed, MatchStatus::Rejected) => via_unmatch,
            _ => false,
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchStatus::Proposed => write!(f, "proposed"),
            MatchStatus::Confirmed => write!(f, "confirmed"),
            MatchStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for MatchStatus {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(MatchStatus::Proposed),
            "confirmed" => Ok(MatchStatus::Confirmed),
            "rejected" => Ok(MatchStatus::Rejected),
            other => Err(FeedError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

pub fn check_transition(
    from: MatchStatus,
    to: MatchStatus,
    via_unmatch: bool,
) -> Result<(), FeedError> {
    if from.can_transition(to, via_unmatch) {
        Ok(())
    } else {
        Err(FeedError::Validation(format!(
            "invalid transition {from} -> {to}"
        )))
    }
}

/// A proposed or confirmed association between a transaction and a ledger
/// record. Rows are never deleted; superseding rows reference their
/// predecessor through `supersedes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Match {
    pub id: Option<MatchId>,
    pub transaction_id: TransactionId,
    pub record_type: LedgerRecordType,
    pub record_id: RecordId,
    pub status: MatchStatus,
    pub confidence: f32,
    pub user_override: bool,
    pub supersedes: Option<MatchId>,
    pub version: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Derived per-transaction state: the active match row (or its absence)
/// decides it. Not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnState {
    Unmatched,
    Proposed,
    Confirmed,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Unmatched => write!(f, "unmatched"),
            TxnState::Proposed => write!(f, "proposed"),
            TxnState::Confirmed => write!(f, "confirmed"),
        }
    }
}

impl FromStr for TxnState {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unmatched" => Ok(TxnState::Unmatched),
            "proposed" => Ok(TxnState::Proposed),
            "confirmed" => Ok(TxnState::Confirmed),
            other => Err(FeedError::Validation(format!("unknown state '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposed_can_confirm_or_reject() {
        assert!(MatchStatus::Proposed.can_transition(MatchStatus::Confirmed, false));
        assert!(MatchStatus::Proposed.can_transition(MatchStatus::Rejected, false));
    }

    #[test]
    fn confirmed_rejects_only_via_unmatch() {
        assert!(!MatchStatus::Confirmed.can_transition(MatchStatus::Rejected, false));
        assert!(MatchStatus::Confirmed.can_transition(MatchStatus::Rejected, true));
    }

    #[test]
    fn rejected_is_terminal() {
        assert!(!MatchStatus::Rejected.can_transition(MatchStatus::Proposed, false));
        assert!(!MatchStatus::Rejected.can_transition(MatchStatus::Confirmed, true));
    }

    #[test]
    fn no_self_transitions() {
        assert!(!MatchStatus::Confirmed.can_transition(MatchStatus::Confirmed, false));
        assert!(!MatchStatus::Proposed.can_transition(MatchStatus::Proposed, false));
    }

    #[test]
    fn check_transition_reports_the_pair() {
        let err = check_transition(MatchStatus::Rejected, MatchStatus::Confirmed, false)
            .unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
        assert!(err.to_string().contains("rejected -> confirmed"));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            MatchStatus::Proposed,
            MatchStatus::Confirmed,
            MatchStatus::Rejected,
        ] {
            assert_eq!(s.to_string().parse::<MatchStatus>().unwrap(), s);
        }
    }

    #[test]
    fn natural_key_display() {
        let key = NaturalKey {
            statement_ref: "a1b2c3".to_string(),
            line_no: 17,
        };
        assert_eq!(key.to_string(), "a1b2c3:17");
    }
}
