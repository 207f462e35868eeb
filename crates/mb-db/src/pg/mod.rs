//! Postgres implementation of the store traits.
//!
//! Multi-row units open an explicit transaction; single-statement units rely
//! on Postgres statement atomicity.

mod export;
mod identity;
mod infra;
mod matching;
mod transactions;

use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use mb_schemas::{
    ExportTransaction, ExportTransactionStatus, FeedType, MatchedTransaction,
    MatchedTransactionStatus, MatchingType, NewExportTransaction, NewMatchedTransaction,
    PaymentTransaction, PaymentTransactionStatus, PendingExport, ResolvedIdentity,
    SchemeTransaction, SchemeTransactionStatus, Transaction, TransactionRecord, TransactionStatus,
    UserIdentity,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Column lists and row mapping
// ---------------------------------------------------------------------------

const LEDGER_COLUMNS: &str = r#"
    id, provider_slug, merchant_slug, transaction_id, feed_type, match_group,
    merchant_identifier_ids, primary_identifier, settlement_key, transaction_date,
    has_time, spend_amount, spend_multiplier, spend_currency, card_token,
    first_six, last_four, auth_code, approval_code, extra_fields, status,
    created_at, updated_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, ledger_id, provider_slug, merchant_slug, transaction_id, feed_type,
    settlement_key, merchant_identifier_ids, primary_identifier, transaction_date,
    has_time, spend_amount, spend_multiplier, spend_currency, card_token,
    first_six, last_four, auth_code, approval_code, status, extra_fields,
    created_at, updated_at
"#;

const SCHEME_COLUMNS: &str = r#"
    id, ledger_id, provider_slug, merchant_slug, transaction_id, match_group,
    merchant_identifier_ids, primary_identifier, transaction_date, has_time,
    spend_amount, spend_multiplier, spend_currency, first_six, last_four,
    auth_code, status, extra_fields, created_at, updated_at
"#;

const IDENTITY_COLUMNS: &str = r#"
    id, transaction_id, loyalty_id, scheme_account_id, user_id,
    payment_card_account_id, first_six, last_four, expiry_month, expiry_year,
    created_at, updated_at
"#;

const MATCHED_COLUMNS: &str = r#"
    id, merchant_identifier_id, primary_identifier, loyalty_scheme_slug,
    transaction_id, transaction_date, spend_amount, spend_multiplier,
    spend_currency, card_token, matching_type, status, payment_transaction_id,
    scheme_transaction_id, extra_fields, created_at, updated_at
"#;

const EXPORT_COLUMNS: &str = r#"
    id, matched_transaction_id, transaction_id, feed_type, provider_slug,
    primary_identifier, transaction_date, spend_amount, spend_currency,
    loyalty_id, user_id, scheme_account_id, payment_card_account_id, first_six,
    last_four, expiry_month, expiry_year, auth_code, approval_code, export_uid,
    status, extra_fields, created_at, updated_at
"#;

const PENDING_EXPORT_COLUMNS: &str = r#"
    id, export_transaction_id, provider_slug, retry_count, retry_at,
    failure_reason, created_at, updated_at
"#;

fn ledger_from_row(row: &PgRow) -> Result<Transaction> {
    let feed_type: String = row.try_get("feed_type")?;
    let status: String = row.try_get("status")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        record: TransactionRecord {
            provider_slug: row.try_get("provider_slug")?,
            merchant_slug: row.try_get("merchant_slug")?,
            transaction_id: row.try_get("transaction_id")?,
            feed_type: FeedType::parse(&feed_type)?,
            merchant_identifier_ids: row.try_get("merchant_identifier_ids")?,
            primary_identifier: row.try_get("primary_identifier")?,
            settlement_key: row.try_get("settlement_key")?,
            transaction_date: row.try_get("transaction_date")?,
            has_time: row.try_get("has_time")?,
            spend_amount: row.try_get("spend_amount")?,
            spend_multiplier: row.try_get("spend_multiplier")?,
            spend_currency: row.try_get("spend_currency")?,
            card_token: row.try_get("card_token")?,
            first_six: row.try_get("first_six")?,
            last_four: row.try_get("last_four")?,
            auth_code: row.try_get("auth_code")?,
            approval_code: row.try_get("approval_code")?,
            extra_fields: row.try_get("extra_fields")?,
        },
        match_group: row.try_get("match_group")?,
        status: TransactionStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<PaymentTransaction> {
    let feed_type: String = row.try_get("feed_type")?;
    let status: String = row.try_get("status")?;
    Ok(PaymentTransaction {
        id: row.try_get("id")?,
        ledger_id: row.try_get("ledger_id")?,
        provider_slug: row.try_get("provider_slug")?,
        merchant_slug: row.try_get("merchant_slug")?,
        transaction_id: row.try_get("transaction_id")?,
        feed_type: FeedType::parse(&feed_type)?,
        settlement_key: row.try_get("settlement_key")?,
        merchant_identifier_ids: row.try_get("merchant_identifier_ids")?,
        primary_identifier: row.try_get("primary_identifier")?,
        transaction_date: row.try_get("transaction_date")?,
        has_time: row.try_get("has_time")?,
        spend_amount: row.try_get("spend_amount")?,
        spend_multiplier: row.try_get("spend_multiplier")?,
        spend_currency: row.try_get("spend_currency")?,
        card_token: row.try_get("card_token")?,
        first_six: row.try_get("first_six")?,
        last_four: row.try_get("last_four")?,
        auth_code: row.try_get("auth_code")?,
        approval_code: row.try_get("approval_code")?,
        status: PaymentTransactionStatus::parse(&status)?,
        extra_fields: row.try_get("extra_fields")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn scheme_from_row(row: &PgRow) -> Result<SchemeTransaction> {
    let status: String = row.try_get("status")?;
    Ok(SchemeTransaction {
        id: row.try_get("id")?,
        ledger_id: row.try_get("ledger_id")?,
        provider_slug: row.try_get("provider_slug")?,
        merchant_slug: row.try_get("merchant_slug")?,
        transaction_id: row.try_get("transaction_id")?,
        match_group: row.try_get("match_group")?,
        merchant_identifier_ids: row.try_get("merchant_identifier_ids")?,
        primary_identifier: row.try_get("primary_identifier")?,
        transaction_date: row.try_get("transaction_date")?,
        has_time: row.try_get("has_time")?,
        spend_amount: row.try_get("spend_amount")?,
        spend_multiplier: row.try_get("spend_multiplier")?,
        spend_currency: row.try_get("spend_currency")?,
        first_six: row.try_get("first_six")?,
        last_four: row.try_get("last_four")?,
        auth_code: row.try_get("auth_code")?,
        status: SchemeTransactionStatus::parse(&status)?,
        extra_fields: row.try_get("extra_fields")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn identity_from_row(row: &PgRow) -> Result<UserIdentity> {
    Ok(UserIdentity {
        id: row.try_get("id")?,
        transaction_id: row.try_get("transaction_id")?,
        identity: ResolvedIdentity {
            loyalty_id: row.try_get("loyalty_id")?,
            scheme_account_id: row.try_get("scheme_account_id")?,
            user_id: row.try_get("user_id")?,
            payment_card_account_id: row.try_get("payment_card_account_id")?,
            first_six: row.try_get("first_six")?,
            last_four: row.try_get("last_four")?,
            expiry_month: row.try_get("expiry_month")?,
            expiry_year: row.try_get("expiry_year")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn matched_from_row(row: &PgRow) -> Result<MatchedTransaction> {
    let matching_type: String = row.try_get("matching_type")?;
    let status: String = row.try_get("status")?;
    Ok(MatchedTransaction {
        id: row.try_get("id")?,
        fields: NewMatchedTransaction {
            merchant_identifier_id: row.try_get("merchant_identifier_id")?,
            primary_identifier: row.try_get("primary_identifier")?,
            loyalty_scheme_slug: row.try_get("loyalty_scheme_slug")?,
            transaction_id: row.try_get("transaction_id")?,
            transaction_date: row.try_get("transaction_date")?,
            spend_amount: row.try_get("spend_amount")?,
            spend_multiplier: row.try_get("spend_multiplier")?,
            spend_currency: row.try_get("spend_currency")?,
            card_token: row.try_get("card_token")?,
            matching_type: MatchingType::parse(&matching_type)?,
            payment_transaction_id: row.try_get("payment_transaction_id")?,
            scheme_transaction_id: row.try_get("scheme_transaction_id")?,
            extra_fields: row.try_get("extra_fields")?,
        },
        status: MatchedTransactionStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn export_from_row(row: &PgRow) -> Result<ExportTransaction> {
    let feed_type: String = row.try_get("feed_type")?;
    let status: String = row.try_get("status")?;
    Ok(ExportTransaction {
        id: row.try_get("id")?,
        fields: NewExportTransaction {
            matched_transaction_id: row.try_get("matched_transaction_id")?,
            transaction_id: row.try_get("transaction_id")?,
            feed_type: FeedType::parse(&feed_type)?,
            provider_slug: row.try_get("provider_slug")?,
            primary_identifier: row.try_get("primary_identifier")?,
            transaction_date: row.try_get("transaction_date")?,
            spend_amount: row.try_get("spend_amount")?,
            spend_currency: row.try_get("spend_currency")?,
            loyalty_id: row.try_get("loyalty_id")?,
            user_id: row.try_get("user_id")?,
            scheme_account_id: row.try_get("scheme_account_id")?,
            payment_card_account_id: row.try_get("payment_card_account_id")?,
            first_six: row.try_get("first_six")?,
            last_four: row.try_get("last_four")?,
            expiry_month: row.try_get("expiry_month")?,
            expiry_year: row.try_get("expiry_year")?,
            auth_code: row.try_get("auth_code")?,
            approval_code: row.try_get("approval_code")?,
            export_uid: row.try_get("export_uid")?,
            extra_fields: row.try_get("extra_fields")?,
        },
        status: ExportTransactionStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn pending_export_from_row(row: &PgRow) -> Result<PendingExport> {
    Ok(PendingExport {
        id: row.try_get("id")?,
        export_transaction_id: row.try_get("export_transaction_id")?,
        provider_slug: row.try_get("provider_slug")?,
        retry_count: row.try_get("retry_count")?,
        retry_at: row.try_get("retry_at")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_rows<T>(rows: &[PgRow], f: fn(&PgRow) -> Result<T>, what: &str) -> Result<Vec<T>> {
    rows.iter()
        .map(|r| f(r).with_context(|| format!("{what} row decode failed")))
        .collect()
}
