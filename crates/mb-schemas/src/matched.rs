use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{MatchedTransactionStatus, MatchingType};

/// Output of a successful correlation, before it is persisted.
///
/// Contributing legs are referenced by id only (no foreign keys) so that legs
/// and matches can be retained independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMatchedTransaction {
    pub merchant_identifier_id: i64,
    pub primary_identifier: String,
    pub loyalty_scheme_slug: String,
    pub transaction_id: String,
    pub transaction_date: DateTime<Utc>,
    pub spend_amount: i64,
    pub spend_multiplier: i32,
    pub spend_currency: String,
    pub card_token: String,
    pub matching_type: MatchingType,
    pub payment_transaction_id: i64,
    pub scheme_transaction_id: Option<i64>,
    pub extra_fields: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedTransaction {
    pub id: i64,
    pub fields: NewMatchedTransaction,
    pub status: MatchedTransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
