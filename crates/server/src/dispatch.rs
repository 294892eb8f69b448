use std::sync::Arc;

use bancroft_core::MatchStatus;
use bancroft_engine::{MatchDecision, MatchEngine};
use bancroft_storage::DbPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::notify::{MatchEvent, Notifier};

/// Background work item. One dispatcher owns all queues; adding a queue
/// means adding a variant and a worker arm, not a second runner process.
#[derive(Debug, Clone)]
pub enum Job {
    /// Run the matching engine over unmatched transactions, optionally
    /// limited to one statement.
    MatchStatement { statement_ref: Option<String> },
}

#[derive(Clone)]
pub struct Dispatcher {
    matching_tx: mpsc::Sender<Job>,
}

impl Dispatcher {
    /// Spawn the worker and hand back the enqueue side. The handle is the
    /// worker task; dropping the last `Dispatcher` closes the channel and
    /// lets it drain and exit.
    pub fn spawn(
        db: DbPool,
        engine: Arc<MatchEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> (Self, JoinHandle<()>) {
        let (matching_tx, mut rx) = mpsc::channel::<Job>(64);

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::MatchStatement { statement_ref } => {
                        if let Err(e) =
                            run_matching(&db, &engine, notifier.as_ref(), statement_ref.as_deref())
                                .await
                        {
                            tracing::warn!("matching job failed: {e}");
                        }
                    }
                }
            }
        });

        (Self { matching_tx }, handle)
    }

    pub async fn enqueue_matching(&self, statement_ref: Option<String>) {
        if self
            .matching_tx
            .send(Job::MatchStatement { statement_ref })
            .await
            .is_err()
        {
            tracing::error!("matching queue closed; job dropped");
        }
    }
}

/// One matching pass. Safe to re-run at any time: it only looks at
/// transactions without an active match, and the candidate pool excludes
/// records that are already taken, so a second pass over the same statement
/// is a no-op.
pub async fn run_matching(
    db: &DbPool,
    engine: &MatchEngine,
    notifier: &dyn Notifier,
    statement_ref: Option<&str>,
) -> Result<(), bancroft_core::FeedError> {
    let txns = bancroft_storage::unmatched_transactions(db, statement_ref).await?;
    tracing::info!(
        transactions = txns.len(),
        statement = statement_ref.unwrap_or("<all>"),
        "matching pass started"
    );

    for txn in txns {
        let Some(txn_id) = txn.id else { continue };
        // Re-fetched per transaction so records taken earlier in this same
        // pass have already dropped out of the pool.
        let pool = bancroft_storage::open_ledger_records(db, None).await?;
        let candidates = engine.find_candidates(&txn, &pool);

        let (candidate, status) = match engine.decide(&candidates) {
            MatchDecision::AutoConfirm(c) => (c, MatchStatus::Confirmed),
            MatchDecision::Propose(c) => (c, MatchStatus::Proposed),
            MatchDecision::NoMatch => continue,
        };

        match bancroft_storage::create_match(
            db,
            txn_id,
            candidate.record_type,
            candidate.record_id,
            status,
            candidate.score,
            false,
            None,
        )
        .await
        {
            Ok(m) => {
                tracing::info!(
                    transaction = %txn_id,
                    amount = %txn.amount(),
                    record = %candidate.record_id,
                    score = candidate.score,
                    status = %status,
                    "match created"
                );
                notifier.match_changed(MatchEvent {
                    transaction_id: txn_id,
                    match_id: m.id,
                    status,
                });
            }
            // Another writer got there first; their match stands.
            Err(e) if !matches!(e, bancroft_core::FeedError::Storage(_)) => {
                tracing::debug!(transaction = %txn_id, "skipped: {e}");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bancroft_core::{BankTransaction, LedgerRecordType, TxnState};
    use bancroft_engine::EngineConfig;
    use bancroft_storage::{create_db, TxnFilter};
    use chrono::NaiveDate;

    struct NullNotifier;
    impl Notifier for NullNotifier {
        fn match_changed(&self, _event: MatchEvent) {}
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    fn txn(line_no: i64, d: u32, amount: i64, desc: &str) -> BankTransaction {
        BankTransaction {
            id: None,
            statement_ref: "stmt-1".to_string(),
            line_no,
            date: day(d),
            amount_cents: amount,
            description: desc.to_string(),
            counterparty: None,
            memo: None,
            check_number: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn matching_pass_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = create_db(&dir.path().join("t.db")).await.unwrap();
        let engine = MatchEngine::new(EngineConfig {
            auto_post: true,
            ..EngineConfig::default()
        });

        bancroft_storage::insert_transactions(
            &db,
            &[
                txn(1, 1, -15000, "ACME SUPPLIES"),
                txn(2, 5, -777, "NO COUNTERPART"),
            ],
        )
        .await
        .unwrap();
        bancroft_storage::insert_ledger_record(
            &db,
            LedgerRecordType::Ap,
            "ACME SUPPLIES INC",
            -15000,
            day(2),
            Some("BILL-1042"),
        )
        .await
        .unwrap();

        run_matching(&db, &engine, &NullNotifier, Some("stmt-1"))
            .await
            .unwrap();

        let confirmed = bancroft_storage::list_transactions(
            &db,
            &TxnFilter {
                state: Some(TxnState::Confirmed),
                ..TxnFilter::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].transaction.line_no, 1);
        let first_match = confirmed[0].matched.clone().unwrap();
        assert!(first_match.confidence >= 0.9);

        // Second pass finds nothing left to do and changes nothing.
        run_matching(&db, &engine, &NullNotifier, Some("stmt-1"))
            .await
            .unwrap();
        let after = bancroft_storage::list_transactions(&db, &TxnFilter::default())
            .await
            .unwrap();
        let still = after
            .iter()
            .find(|t| t.transaction.line_no == 1)
            .and_then(|t| t.matched.clone())
            .unwrap();
        assert_eq!(still.match_id, first_match.match_id);
        assert!(after
            .iter()
            .any(|t| t.transaction.line_no == 2 && t.state == TxnState::Unmatched));
    }

    #[tokio::test]
    async fn one_record_cannot_serve_two_transactions_in_a_pass() {
        let dir = tempfile::tempdir().unwrap();
        let db = create_db(&dir.path().join("t.db")).await.unwrap();
        let engine = MatchEngine::new(EngineConfig {
            auto_post: true,
            ..EngineConfig::default()
        });

        // Two identical transactions, one open record.
        bancroft_storage::insert_transactions(
            &db,
            &[txn(1, 1, -5000, "GRID UTILITIES"), txn(2, 1, -5000, "GRID UTILITIES")],
        )
        .await
        .unwrap();
        bancroft_storage::insert_ledger_record(
            &db,
            LedgerRecordType::Expense,
            "GRID UTILITIES",
            -5000,
            day(1),
            None,
        )
        .await
        .unwrap();

        run_matching(&db, &engine, &NullNotifier, None).await.unwrap();

        let all = bancroft_storage::list_transactions(&db, &TxnFilter::default())
            .await
            .unwrap();
        let matched = all.iter().filter(|t| t.matched.is_some()).count();
        assert_eq!(matched, 1);
    }
}
