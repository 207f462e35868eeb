//! Store traits.
//!
//! Every trait is object-safe so directors hold an `Arc<dyn Store>` and tests
//! swap in the in-memory implementation from `mb-testkit`. Methods documented
//! as "one unit" must be all-or-nothing.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mb_schemas::{
    ExportTransaction, FeedType, IdentifierType, MatchedTransaction, MerchantIdentifier,
    NewExportTransaction, NewMatchedTransaction, PaymentTransaction, PendingExport,
    ResolvedIdentity, RetryEntry, RetryKind, SchemeTransaction, Transaction, TransactionRecord,
    UserIdentity,
};

/// Natural key of a row in the `transactions` ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub provider_slug: String,
    pub merchant_slug: String,
    pub transaction_id: String,
    pub feed_type: FeedType,
}

impl LedgerKey {
    pub fn of(record: &TransactionRecord) -> Self {
        Self {
            provider_slug: record.provider_slug.clone(),
            merchant_slug: record.merchant_slug.clone(),
            transaction_id: record.transaction_id.clone(),
            feed_type: record.feed_type,
        }
    }
}

/// Result of [`TransactionStore::apply_settlement_override`].
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOverride {
    Applied(PaymentTransaction),
    /// The settled leg's ledger key is already recorded.
    AlreadyApplied,
    /// The AUTH leg has left PENDING.
    NotPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMerchantIdentifier {
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub location_id: Option<String>,
    pub merchant_internal_id: Option<String>,
    pub loyalty_scheme_slug: String,
    pub payment_provider_slug: Option<String>,
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Subset of `keys` already present in the ledger.
    async fn existing_ledger_keys(&self, keys: &[LedgerKey]) -> Result<HashSet<LedgerKey>>;

    /// Ledger row by natural key.
    async fn fetch_ledger_row(&self, key: &LedgerKey) -> Result<Option<Transaction>>;

    /// Persist scheme legs (ledger + scheme rows) in one unit. Records whose
    /// ledger key appeared concurrently are skipped. Returns the new scheme
    /// transaction ids in input order.
    async fn insert_scheme_transactions(
        &self,
        match_group: &str,
        records: &[TransactionRecord],
    ) -> Result<Vec<i64>>;

    /// Persist one payment leg (ledger + payment row) in one unit as PENDING.
    /// `None` if the ledger key already exists.
    async fn insert_payment_transaction(
        &self,
        match_group: &str,
        record: &TransactionRecord,
    ) -> Result<Option<PaymentTransaction>>;

    /// Payment leg of `feed_type` carrying `settlement_key`, oldest first.
    async fn find_payment_by_settlement_key(
        &self,
        settlement_key: &str,
        feed_type: FeedType,
    ) -> Result<Option<PaymentTransaction>>;

    /// Back-fill a settled leg onto a PENDING AUTH leg in one unit:
    ///
    /// - the settled leg gets its own ledger row under `match_group`,
    /// - `spend_amount` and `transaction_id` take the settled values,
    /// - `first_six`, `last_four`, `auth_code` are only written when empty,
    /// - the AUTH ledger row mirrors the same change,
    /// - an identity keyed by the old transaction id is re-keyed.
    ///
    /// Nothing is written unless the outcome is `Applied`.
    async fn apply_settlement_override(
        &self,
        auth_id: i64,
        match_group: &str,
        settled: &TransactionRecord,
    ) -> Result<SettlementOverride>;

    async fn fetch_payment_transaction(&self, id: i64) -> Result<Option<PaymentTransaction>>;

    async fn fetch_scheme_transaction(&self, id: i64) -> Result<Option<SchemeTransaction>>;

    async fn scheme_transactions_since(
        &self,
        from_date: DateTime<Utc>,
    ) -> Result<Vec<SchemeTransaction>>;

    async fn scheme_transactions_in_group(
        &self,
        match_group: &str,
    ) -> Result<Vec<SchemeTransaction>>;

    /// PENDING scheme legs sharing at least one merchant identifier.
    async fn pending_scheme_transactions_for_identifiers(
        &self,
        merchant_identifier_ids: &[i64],
    ) -> Result<Vec<SchemeTransaction>>;

    /// Ids of PENDING payment legs sharing at least one merchant identifier
    /// and already carrying a resolved identity.
    async fn pending_identified_payment_ids(
        &self,
        merchant_identifier_ids: &[i64],
    ) -> Result<Vec<i64>>;
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn fetch_identity(&self, transaction_id: &str) -> Result<Option<UserIdentity>>;

    /// Insert-once. An existing identity for `transaction_id` is returned
    /// unchanged.
    async fn insert_identity(
        &self,
        transaction_id: &str,
        identity: &ResolvedIdentity,
    ) -> Result<UserIdentity>;

    /// Fill payment-card fields that are still empty. Identity fields proper
    /// are never touched.
    async fn attach_card_metadata(
        &self,
        transaction_id: &str,
        identity: &ResolvedIdentity,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MatchingStore: Send + Sync {
    async fn merchant_identifiers(&self, ids: &[i64]) -> Result<Vec<MerchantIdentifier>>;

    /// One unit: payment leg PENDING -> MATCHED, scheme leg (if any)
    /// PENDING -> MATCHED, both ledger rows -> MATCHED, matched row inserted.
    ///
    /// Returns `None` and writes nothing if either leg has left PENDING since
    /// it was read.
    async fn persist_match(&self, matched: &NewMatchedTransaction) -> Result<Option<i64>>;

    async fn fetch_matched_transaction(&self, id: i64) -> Result<Option<MatchedTransaction>>;

    /// The matched transaction a payment leg produced, if any.
    async fn fetch_match_for_payment(
        &self,
        payment_transaction_id: i64,
    ) -> Result<Option<MatchedTransaction>>;
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExportStore: Send + Sync {
    /// One unit: insert the export snapshot and its first pending export
    /// (`retry_count = 0`, `retry_at = null`). Returns the pending export, or
    /// `None` without writing if the matched transaction already has an
    /// export.
    async fn create_export(&self, export: &NewExportTransaction)
        -> Result<Option<PendingExport>>;

    async fn fetch_export_transaction(&self, id: i64) -> Result<Option<ExportTransaction>>;

    async fn fetch_pending_export(&self, id: i64) -> Result<Option<PendingExport>>;

    /// One unit: export, matched transaction, legs and ledger rows ->
    /// EXPORTED; the pending export row is deleted. `false` if the pending
    /// export no longer exists.
    async fn complete_export(&self, pending_export_id: i64) -> Result<bool>;

    /// Record a failure: `failure_reason`, `retry_at`, export and matched
    /// transaction -> EXPORT_FAILED. `retry_count` is left alone.
    async fn fail_export(
        &self,
        pending_export_id: i64,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Single statement: every row with `retry_at <= now` gets
    /// `retry_count + 1` and `retry_at = null`. Returns the updated rows.
    async fn claim_due_exports(&self, now: DateTime<Utc>) -> Result<Vec<PendingExport>>;

    /// Pending exports for a provider that are neither scheduled for retry
    /// nor claimed, oldest first.
    async fn ready_exports_for_provider(
        &self,
        provider_slug: &str,
        limit: i64,
    ) -> Result<Vec<PendingExport>>;

    async fn count_pending_exports(&self) -> Result<i64>;
}

// ---------------------------------------------------------------------------
// Infrastructure
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Current `next_value`, creating the row with `default` on first use.
    async fn next_value(&self, provider_slug: &str, default: i64) -> Result<i64>;

    async fn set_next_value(&self, provider_slug: &str, value: i64) -> Result<()>;

    /// Atomically advance by `count` and return the first reserved value.
    /// The reserved range is `[start, start + count)`.
    async fn reserve_sequence(&self, provider_slug: &str, count: i64, default: i64)
        -> Result<i64>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, key: &str) -> Result<Option<String>>;

    async fn set_config(&self, key: &str, value: &str) -> Result<()>;
}

#[async_trait]
pub trait RetryStore: Send + Sync {
    async fn fetch_retry(&self, kind: RetryKind, entity_id: i64) -> Result<Option<RetryEntry>>;

    /// Upsert: set `retry_at` and `failure_reason`, keep `retry_count`.
    async fn schedule_retry(
        &self,
        kind: RetryKind,
        entity_id: i64,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Same contract as [`ExportStore::claim_due_exports`].
    async fn claim_due_retries(&self, kind: RetryKind, now: DateTime<Utc>)
        -> Result<Vec<RetryEntry>>;

    async fn clear_retry(&self, kind: RetryKind, entity_id: i64) -> Result<()>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomic check-and-set: take `name` if it is free, expired, or already
    /// held by `owner`, and extend its expiry to now + `ttl`.
    async fn try_acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Release only if still held by `owner`.
    async fn release_lock(&self, name: &str, owner: &str) -> Result<()>;
}

/// Out-of-band reference data (merchant identifiers and their owners).
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    async fn insert_merchant_identifier(&self, mid: &NewMerchantIdentifier) -> Result<i64>;
}

/// Everything the pipeline persists.
pub trait Store:
    TransactionStore
    + IdentityStore
    + MatchingStore
    + ExportStore
    + SequenceStore
    + ConfigStore
    + RetryStore
    + LockStore
    + ReferenceStore
{
}

impl<T> Store for T where
    T: TransactionStore
        + IdentityStore
        + MatchingStore
        + ExportStore
        + SequenceStore
        + ConfigStore
        + RetryStore
        + LockStore
        + ReferenceStore
{
}
