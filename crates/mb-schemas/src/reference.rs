use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{IdentifierType, RetryKind};

/// A physical or logical acceptance point, scoped to a loyalty scheme and
/// optionally a payment provider. Reference data, created out-of-band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantIdentifier {
    pub id: i64,
    pub identifier: String,
    pub identifier_type: IdentifierType,
    pub location_id: Option<String>,
    pub merchant_internal_id: Option<String>,
    pub loyalty_scheme_id: i64,
    pub loyalty_scheme_slug: String,
    pub payment_provider_id: Option<i64>,
    pub payment_provider_slug: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSequenceNumber {
    pub provider_slug: String,
    pub next_value: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Retry bookkeeping for identify / matching work. Same null-means-in-flight
/// contract as [`crate::PendingExport::retry_at`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub kind: RetryKind,
    pub entity_id: i64,
    pub retry_count: i32,
    pub retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}
