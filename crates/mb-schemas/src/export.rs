use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{ExportTransactionStatus, FeedType};

/// Export-ready snapshot of a matched transaction plus the identity and
/// payment-card fields a destination needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExportTransaction {
    pub matched_transaction_id: i64,
    pub transaction_id: String,
    pub feed_type: FeedType,
    /// Destination slug (the loyalty scheme the match belongs to).
    pub provider_slug: String,
    pub primary_identifier: String,
    pub transaction_date: DateTime<Utc>,
    pub spend_amount: i64,
    pub spend_currency: String,
    pub loyalty_id: Option<String>,
    pub user_id: Option<i64>,
    pub scheme_account_id: Option<i64>,
    pub payment_card_account_id: Option<i64>,
    pub first_six: Option<String>,
    pub last_four: Option<String>,
    pub expiry_month: Option<i32>,
    pub expiry_year: Option<i32>,
    pub auth_code: String,
    pub approval_code: String,
    /// Idempotency token presented to the destination.
    pub export_uid: Uuid,
    pub extra_fields: Value,
}

/// Immutable once created, except for `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportTransaction {
    pub id: i64,
    pub fields: NewExportTransaction,
    pub status: ExportTransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One in-flight export attempt; the unit of retry work.
///
/// `retry_at` is `None` while the attempt is queued or running, and only set
/// after a failure. The retry sweep clears it again before re-enqueueing, so a
/// row is never due twice for the same failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingExport {
    pub id: i64,
    pub export_transaction_id: i64,
    pub provider_slug: String,
    pub retry_count: i32,
    pub retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingExport {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.retry_at, Some(at) if at <= now)
    }
}
