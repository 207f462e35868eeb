use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use mb_db::{NewMerchantIdentifier, ReferenceStore};
use mb_schemas::{FeedType, IdentifierType, ResolvedIdentity, TransactionRecord};

/// Fixed UTC timestamp helper: `ts(2024, 3, 1, 12, 0)`.
pub fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Builder for [`TransactionRecord`] with sensible defaults.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: TransactionRecord,
}

impl RecordBuilder {
    pub fn new(provider_slug: &str, transaction_id: &str, feed_type: FeedType) -> Self {
        Self {
            record: TransactionRecord {
                provider_slug: provider_slug.to_string(),
                merchant_slug: "test-merchant".to_string(),
                transaction_id: transaction_id.to_string(),
                feed_type,
                merchant_identifier_ids: Vec::new(),
                primary_identifier: "MID-1".to_string(),
                settlement_key: None,
                transaction_date: ts(2024, 3, 1, 12, 0),
                has_time: true,
                spend_amount: 100,
                spend_multiplier: 100,
                spend_currency: "GBP".to_string(),
                card_token: "card-token-1".to_string(),
                first_six: None,
                last_four: None,
                auth_code: String::new(),
                approval_code: String::new(),
                extra_fields: serde_json::json!({}),
            },
        }
    }

    pub fn settlement_key(mut self, key: &str) -> Self {
        self.record.settlement_key = Some(key.to_string());
        self
    }

    pub fn amount(mut self, amount: i64) -> Self {
        self.record.spend_amount = amount;
        self
    }

    pub fn auth_code(mut self, code: &str) -> Self {
        self.record.auth_code = code.to_string();
        self
    }

    pub fn card(mut self, first_six: &str, last_four: &str) -> Self {
        self.record.first_six = Some(first_six.to_string());
        self.record.last_four = Some(last_four.to_string());
        self
    }

    pub fn card_token(mut self, token: &str) -> Self {
        self.record.card_token = token.to_string();
        self
    }

    pub fn merchant_identifiers(mut self, ids: &[i64]) -> Self {
        self.record.merchant_identifier_ids = ids.to_vec();
        self
    }

    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.record.transaction_date = when;
        self
    }

    pub fn build(self) -> TransactionRecord {
        self.record
    }
}

pub fn auth_record(transaction_id: &str, settlement_key: &str, amount: i64) -> TransactionRecord {
    RecordBuilder::new("visa", transaction_id, FeedType::Auth)
        .settlement_key(settlement_key)
        .amount(amount)
        .build()
}

pub fn settled_record(
    transaction_id: &str,
    settlement_key: &str,
    amount: i64,
) -> TransactionRecord {
    RecordBuilder::new("visa", transaction_id, FeedType::Settled)
        .settlement_key(settlement_key)
        .amount(amount)
        .build()
}

pub fn refund_record(transaction_id: &str, amount: i64) -> TransactionRecord {
    RecordBuilder::new("visa", transaction_id, FeedType::Refund)
        .amount(amount)
        .build()
}

pub fn scheme_record(transaction_id: &str, merchant_identifier_ids: &[i64]) -> TransactionRecord {
    RecordBuilder::new("test-scheme", transaction_id, FeedType::Merchant)
        .merchant_identifiers(merchant_identifier_ids)
        .build()
}

pub fn identity(loyalty_id: &str) -> ResolvedIdentity {
    ResolvedIdentity {
        loyalty_id: loyalty_id.to_string(),
        scheme_account_id: 10,
        user_id: 20,
        payment_card_account_id: Some(30),
        first_six: Some("424242".to_string()),
        last_four: Some("4242".to_string()),
        expiry_month: Some(12),
        expiry_year: Some(2030),
    }
}

/// Seed one PRIMARY identifier for `scheme_slug` and return its id.
pub async fn merchant_identifier<S: ReferenceStore + ?Sized>(
    store: &S,
    scheme_slug: &str,
    identifier: &str,
) -> Result<i64> {
    store
        .insert_merchant_identifier(&NewMerchantIdentifier {
            identifier: identifier.to_string(),
            identifier_type: IdentifierType::Primary,
            location_id: None,
            merchant_internal_id: None,
            loyalty_scheme_slug: scheme_slug.to_string(),
            payment_provider_slug: Some("visa".to_string()),
        })
        .await
}
