//! Candidate scoring and auto-apply policy for bank-feed matching.
//!
//! The engine is pure: it takes a transaction and a pool of open ledger
//! records and produces scored candidates plus a posting decision. Loading
//! the pool and writing match rows is the storage layer's business.

mod text;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use bancroft_core::{BankTransaction, LedgerRecordType, OpenLedgerRecord, RecordId};

pub use text::token_overlap;

/// Scoring weights and thresholds. All knobs live here rather than in code;
/// the server exposes them under `[matching]` in its config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub amount_weight: f32,
    pub date_weight: f32,
    pub description_weight: f32,
    pub date_window_days: i64,
    pub amount_tolerance_cents: i64,
    /// Minimum top score for auto-confirming without review.
    pub confidence_threshold: f32,
    /// A runner-up this close to the top candidate blocks auto-posting.
    pub ambiguity_gap: f32,
    /// Below this floor no match row is created at all.
    pub min_floor: f32,
    pub auto_post: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            amount_weight: 0.50,
            date_weight: 0.30,
            description_weight: 0.20,
            date_window_days: 5,
            amount_tolerance_cents: 1,
            confidence_threshold: 0.75,
            ambiguity_gap: 0.05,
            min_floor: 0.30,
            auto_post: false,
        }
    }
}

/// A scored prospective link. Transient: recomputed per query, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub record_id: RecordId,
    pub record_type: LedgerRecordType,
    pub score: f32,
    pub amount_exact: bool,
    pub date_distance_days: i64,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    /// Top candidate clears the threshold unambiguously and auto-post is on.
    AutoConfirm(MatchCandidate),
    /// A plausible candidate exists but needs user confirmation.
    Propose(MatchCandidate),
    /// Nothing cleared the floor; the transaction stays unmatched.
    NoMatch,
}

pub struct MatchEngine {
    config: EngineConfig,
}

impl MatchEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Score every record in the pool against the transaction, highest score
    /// first. Ties break by nearest date, then lowest record id, so repeated
    /// calls over identical inputs return identical orderings.
    pub fn find_candidates(
        &self,
        txn: &BankTransaction,
        pool: &[OpenLedgerRecord],
    ) -> Vec<MatchCandidate> {
        let mut candidates: Vec<MatchCandidate> = pool
            .iter()
            .filter_map(|rec| self.score_pair(txn, rec))
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.date_distance_days.cmp(&b.date_distance_days))
                .then(a.record_id.0.cmp(&b.record_id.0))
        });
        candidates
    }

    /// Auto-apply policy over an already-sorted candidate list.
    pub fn decide(&self, candidates: &[MatchCandidate]) -> MatchDecision {
        let Some(top) = candidates.first() else {
            return MatchDecision::NoMatch;
        };
        if top.score < self.config.min_floor {
            return MatchDecision::NoMatch;
        }

        let ambiguous = candidates
            .get(1)
            .is_some_and(|second| top.score - second.score <= self.config.ambiguity_gap);

        if self.config.auto_post && !ambiguous && top.score >= self.config.confidence_threshold {
            MatchDecision::AutoConfirm(top.clone())
        } else {
            MatchDecision::Propose(top.clone())
        }
    }

    fn score_pair(
        &self,
        txn: &BankTransaction,
        rec: &OpenLedgerRecord,
    ) -> Option<MatchCandidate> {
        let diff_cents = (txn.amount_cents - rec.amount_cents).abs();
        if diff_cents > self.config.amount_tolerance_cents {
            return None;
        }

        let date_distance = (txn.date - rec.date).num_days().abs();
        if date_distance > self.config.date_window_days {
            return None;
        }

        // Date contribution decays linearly to zero at the window edge.
        let date_factor = 1.0 - date_distance as f32 / self.config.date_window_days as f32;

        let txn_text = match &txn.counterparty {
            Some(cp) => format!("{} {}", txn.description, cp),
            None => txn.description.clone(),
        };
        let similarity = token_overlap(&txn_text, &rec.counterparty);

        let score = (self.config.amount_weight
            + self.config.date_weight * date_factor
            + self.config.description_weight * similarity)
            .clamp(0.0, 1.0);

        Some(MatchCandidate {
            record_id: rec.id,
            record_type: rec.record_type,
            score,
            amount_exact: diff_cents == 0,
            date_distance_days: date_distance,
            similarity,
        })
    }
}
