//! mb-schemas
//!
//! Persisted data model for the reconciliation pipeline. Each entity carries
//! its own status type so that a value can only ever hold the states that are
//! legal for that table (a matched transaction cannot be `IMPORTED`, a payment
//! leg cannot be `EXPORT_FAILED`).
//!
//! Nothing here performs IO; `mb-db` maps these types to and from rows.

mod status;

pub mod export;
pub mod identity;
pub mod job;
pub mod matched;
pub mod reference;
pub mod transaction;

pub use export::{ExportTransaction, NewExportTransaction, PendingExport};
pub use identity::{ResolvedIdentity, UserIdentity};
pub use job::{Job, QueueName};
pub use matched::{MatchedTransaction, NewMatchedTransaction};
pub use reference::{ConfigItem, FileSequenceNumber, MerchantIdentifier, RetryEntry};
pub use status::{
    ExportTransactionStatus, FeedType, IdentifierType, MatchedTransactionStatus, MatchingType,
    PaymentTransactionStatus, RetryKind, SchemeTransactionStatus, TransactionStatus,
};
pub use transaction::{PaymentTransaction, SchemeTransaction, Transaction, TransactionRecord};
