pub mod error;
pub mod feed;
pub mod money;
pub mod summary;

pub use error::FeedError;
pub use feed::{
    check_transition, BankTransaction, LedgerRecordType, Match, MatchId, MatchStatus, NaturalKey,
    OpenLedgerRecord, RecordId, TransactionId, TxnState,
};
pub use money::Money;
pub use summary::FeedSummary;
