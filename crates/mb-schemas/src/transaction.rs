use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FeedType, PaymentTransactionStatus, SchemeTransactionStatus, TransactionStatus};

// ---------------------------------------------------------------------------
// TransactionRecord - import input
// ---------------------------------------------------------------------------

/// Feed-agnostic leg produced by a per-provider import adapter.
///
/// Monetary amounts are integer minor units (pence/cents) with an explicit
/// multiplier; no floats cross the import boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub provider_slug: String,
    pub merchant_slug: String,
    /// Merchant / network assigned id. Unique only together with slugs and feed.
    pub transaction_id: String,
    pub feed_type: FeedType,
    /// Candidate identifiers; narrowed to one during matching.
    pub merchant_identifier_ids: Vec<i64>,
    pub primary_identifier: String,
    /// Links an AUTH leg to its later SETTLED leg.
    pub settlement_key: Option<String>,
    pub transaction_date: DateTime<Utc>,
    /// `false` when the feed only carried a date.
    pub has_time: bool,
    pub spend_amount: i64,
    pub spend_multiplier: i32,
    pub spend_currency: String,
    pub card_token: String,
    pub first_six: Option<String>,
    pub last_four: Option<String>,
    pub auth_code: String,
    pub approval_code: String,
    pub extra_fields: Value,
}

impl TransactionRecord {
    /// Settlement key, treating an empty string the same as absent.
    pub fn settlement_key(&self) -> Option<&str> {
        self.settlement_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Transaction - ledger row
// ---------------------------------------------------------------------------

/// One row of the `transactions` ledger. Unique on
/// `(provider_slug, merchant_slug, transaction_id, feed_type)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub record: TransactionRecord,
    pub match_group: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Payment leg
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: i64,
    /// Ledger row this leg was recorded under.
    pub ledger_id: i64,
    pub provider_slug: String,
    pub merchant_slug: String,
    pub transaction_id: String,
    pub feed_type: FeedType,
    pub settlement_key: Option<String>,
    pub merchant_identifier_ids: Vec<i64>,
    pub primary_identifier: String,
    pub transaction_date: DateTime<Utc>,
    pub has_time: bool,
    pub spend_amount: i64,
    pub spend_multiplier: i32,
    pub spend_currency: String,
    pub card_token: String,
    pub first_six: Option<String>,
    pub last_four: Option<String>,
    pub auth_code: String,
    pub approval_code: String,
    pub status: PaymentTransactionStatus,
    pub extra_fields: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn is_pending(&self) -> bool {
        self.status == PaymentTransactionStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Scheme leg
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemeTransaction {
    pub id: i64,
    pub ledger_id: i64,
    pub provider_slug: String,
    pub merchant_slug: String,
    pub transaction_id: String,
    pub match_group: String,
    pub merchant_identifier_ids: Vec<i64>,
    pub primary_identifier: String,
    pub transaction_date: DateTime<Utc>,
    pub has_time: bool,
    pub spend_amount: i64,
    pub spend_multiplier: i32,
    pub spend_currency: String,
    pub first_six: Option<String>,
    pub last_four: Option<String>,
    pub auth_code: String,
    pub status: SchemeTransactionStatus,
    pub extra_fields: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
