use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cardholder / loyalty-member identity as returned by the external
/// identification service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub loyalty_id: String,
    pub scheme_account_id: i64,
    pub user_id: i64,
    pub payment_card_account_id: Option<i64>,
    pub first_six: Option<String>,
    pub last_four: Option<String>,
    pub expiry_month: Option<i32>,
    pub expiry_year: Option<i32>,
}

/// Persisted identity for one payment leg, keyed by that leg's `transaction_id`.
///
/// Written once by identification; afterwards only payment-card metadata may
/// be attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: i64,
    pub transaction_id: String,
    pub identity: ResolvedIdentity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
