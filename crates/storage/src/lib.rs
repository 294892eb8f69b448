pub mod db;
pub mod feed;

pub use db::{create_db, ping, DbPool};
pub use feed::{
    active_match, bulk_transition, confirm_match, confirm_proposed_above, create_match,
    get_match, get_transaction, insert_ledger_record, insert_transactions, list_transactions,
    open_ledger_records, propose_match, record_statement, reject_below, reject_match, summary,
    transition_match, transition_match_versioned, unmatch, unmatched_transactions, BulkOutcome,
    InsertReport, MatchedEntity, TransactionView, TxnFilter,
};
