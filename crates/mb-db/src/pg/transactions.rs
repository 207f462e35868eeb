use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use tracing::debug;

use mb_schemas::{
    FeedType, PaymentTransaction, SchemeTransaction, Transaction, TransactionRecord,
    TransactionStatus,
};

use super::{
    ledger_from_row, map_rows, payment_from_row, scheme_from_row, PgStore, LEDGER_COLUMNS,
    PAYMENT_COLUMNS, SCHEME_COLUMNS,
};
use crate::store::{LedgerKey, SettlementOverride, TransactionStore};

/// Insert one ledger row; `None` when the natural key already exists.
async fn insert_ledger_row(
    conn: &mut PgConnection,
    match_group: &str,
    record: &TransactionRecord,
) -> Result<Option<i64>> {
    let row = sqlx::query(
        r#"
        insert into transactions (
          provider_slug, merchant_slug, transaction_id, feed_type, match_group,
          merchant_identifier_ids, primary_identifier, settlement_key, transaction_date,
          has_time, spend_amount, spend_multiplier, spend_currency, card_token,
          first_six, last_four, auth_code, approval_code, extra_fields, status
        ) values (
          $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
          $11, $12, $13, $14, $15, $16, $17, $18, $19, $20
        )
        on conflict on constraint uq_transactions_leg do nothing
        returning id
        "#,
    )
    .bind(&record.provider_slug)
    .bind(&record.merchant_slug)
    .bind(&record.transaction_id)
    .bind(record.feed_type.as_str())
    .bind(match_group)
    .bind(&record.merchant_identifier_ids)
    .bind(&record.primary_identifier)
    .bind(record.settlement_key())
    .bind(record.transaction_date)
    .bind(record.has_time)
    .bind(record.spend_amount)
    .bind(record.spend_multiplier)
    .bind(&record.spend_currency)
    .bind(&record.card_token)
    .bind(&record.first_six)
    .bind(&record.last_four)
    .bind(&record.auth_code)
    .bind(&record.approval_code)
    .bind(&record.extra_fields)
    .bind(TransactionStatus::Imported.as_str())
    .fetch_optional(&mut *conn)
    .await
    .context("insert ledger row failed")?;

    match row {
        Some(r) => Ok(Some(r.try_get("id")?)),
        None => Ok(None),
    }
}

#[async_trait]
impl TransactionStore for PgStore {
    async fn existing_ledger_keys(&self, keys: &[LedgerKey]) -> Result<HashSet<LedgerKey>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let providers: Vec<String> = keys.iter().map(|k| k.provider_slug.clone()).collect();
        let merchants: Vec<String> = keys.iter().map(|k| k.merchant_slug.clone()).collect();
        let txids: Vec<String> = keys.iter().map(|k| k.transaction_id.clone()).collect();
        let feeds: Vec<String> = keys.iter().map(|k| k.feed_type.as_str().to_string()).collect();

        let rows = sqlx::query(
            r#"
            select t.provider_slug, t.merchant_slug, t.transaction_id, t.feed_type
            from transactions t
            join unnest($1::text[], $2::text[], $3::text[], $4::text[]) as k(p, m, tid, ft)
              on t.provider_slug = k.p
             and t.merchant_slug = k.m
             and t.transaction_id = k.tid
             and t.feed_type = k.ft
            "#,
        )
        .bind(&providers)
        .bind(&merchants)
        .bind(&txids)
        .bind(&feeds)
        .fetch_all(&self.pool)
        .await
        .context("existing_ledger_keys failed")?;

        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            let feed: String = row.try_get("feed_type")?;
            out.insert(LedgerKey {
                provider_slug: row.try_get("provider_slug")?,
                merchant_slug: row.try_get("merchant_slug")?,
                transaction_id: row.try_get("transaction_id")?,
                feed_type: FeedType::parse(&feed)?,
            });
        }
        Ok(out)
    }

    async fn fetch_ledger_row(&self, key: &LedgerKey) -> Result<Option<Transaction>> {
        let sql = format!(
            "select {LEDGER_COLUMNS} from transactions \
             where provider_slug = $1 and merchant_slug = $2 \
               and transaction_id = $3 and feed_type = $4"
        );
        let row = sqlx::query(&sql)
            .bind(&key.provider_slug)
            .bind(&key.merchant_slug)
            .bind(&key.transaction_id)
            .bind(key.feed_type.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("fetch_ledger_row failed")?;
        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn insert_scheme_transactions(
        &self,
        match_group: &str,
        records: &[TransactionRecord],
    ) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await.context("begin scheme insert tx")?;
        let mut ids = Vec::with_capacity(records.len());

        for record in records {
            let Some(ledger_id) = insert_ledger_row(&mut *tx, match_group, record).await? else {
                debug!(
                    transaction_id = %record.transaction_id,
                    match_group,
                    "scheme leg already in ledger; skipped"
                );
                continue;
            };

            let (id,): (i64,) = sqlx::query_as(
                r#"
                insert into scheme_transactions (
                  ledger_id, provider_slug, merchant_slug, transaction_id, match_group,
                  merchant_identifier_ids, primary_identifier, transaction_date, has_time,
                  spend_amount, spend_multiplier, spend_currency, first_six, last_four,
                  auth_code, status, extra_fields
                ) values (
                  $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                  'PENDING', $16
                )
                returning id
                "#,
            )
            .bind(ledger_id)
            .bind(&record.provider_slug)
            .bind(&record.merchant_slug)
            .bind(&record.transaction_id)
            .bind(match_group)
            .bind(&record.merchant_identifier_ids)
            .bind(&record.primary_identifier)
            .bind(record.transaction_date)
            .bind(record.has_time)
            .bind(record.spend_amount)
            .bind(record.spend_multiplier)
            .bind(&record.spend_currency)
            .bind(&record.first_six)
            .bind(&record.last_four)
            .bind(&record.auth_code)
            .bind(&record.extra_fields)
            .fetch_one(&mut *tx)
            .await
            .context("insert scheme_transactions failed")?;
            ids.push(id);
        }

        tx.commit().await.context("commit scheme insert tx")?;
        Ok(ids)
    }

    async fn insert_payment_transaction(
        &self,
        match_group: &str,
        record: &TransactionRecord,
    ) -> Result<Option<PaymentTransaction>> {
        let mut tx = self.pool.begin().await.context("begin payment insert tx")?;

        let Some(ledger_id) = insert_ledger_row(&mut *tx, match_group, record).await? else {
            tx.rollback().await.context("rollback payment insert tx")?;
            return Ok(None);
        };

        let sql = format!(
            r#"
            insert into payment_transactions (
              ledger_id, provider_slug, merchant_slug, transaction_id, feed_type,
              settlement_key, merchant_identifier_ids, primary_identifier, transaction_date,
              has_time, spend_amount, spend_multiplier, spend_currency, card_token,
              first_six, last_four, auth_code, approval_code, status, extra_fields
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
              $11, $12, $13, $14, $15, $16, $17, $18, 'PENDING', $19
            )
            returning {PAYMENT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(ledger_id)
            .bind(&record.provider_slug)
            .bind(&record.merchant_slug)
            .bind(&record.transaction_id)
            .bind(record.feed_type.as_str())
            .bind(record.settlement_key())
            .bind(&record.merchant_identifier_ids)
            .bind(&record.primary_identifier)
            .bind(record.transaction_date)
            .bind(record.has_time)
            .bind(record.spend_amount)
            .bind(record.spend_multiplier)
            .bind(&record.spend_currency)
            .bind(&record.card_token)
            .bind(&record.first_six)
            .bind(&record.last_four)
            .bind(&record.auth_code)
            .bind(&record.approval_code)
            .bind(&record.extra_fields)
            .fetch_one(&mut *tx)
            .await
            .context("insert payment_transactions failed")?;
        let payment = payment_from_row(&row)?;

        tx.commit().await.context("commit payment insert tx")?;
        Ok(Some(payment))
    }

    async fn find_payment_by_settlement_key(
        &self,
        settlement_key: &str,
        feed_type: FeedType,
    ) -> Result<Option<PaymentTransaction>> {
        let sql = format!(
            "select {PAYMENT_COLUMNS} from payment_transactions \
             where settlement_key = $1 and feed_type = $2 \
             order by id limit 1"
        );
        let row = sqlx::query(&sql)
            .bind(settlement_key)
            .bind(feed_type.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("find_payment_by_settlement_key failed")?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn apply_settlement_override(
        &self,
        auth_id: i64,
        match_group: &str,
        settled: &TransactionRecord,
    ) -> Result<SettlementOverride> {
        let mut tx = self.pool.begin().await.context("begin override tx")?;

        if insert_ledger_row(&mut *tx, match_group, settled).await?.is_none() {
            tx.rollback().await.context("rollback override tx")?;
            return Ok(SettlementOverride::AlreadyApplied);
        }

        // `old` is read from the pre-update snapshot.
        let sql = format!(
            r#"
            with old as (
              select id as old_id, transaction_id as old_transaction_id
              from payment_transactions
              where id = $1
            )
            update payment_transactions
            set spend_amount   = $2,
                transaction_id = $3,
                first_six      = coalesce(nullif(first_six, ''), $4),
                last_four      = coalesce(nullif(last_four, ''), $5),
                auth_code      = case when auth_code = '' then $6 else auth_code end,
                updated_at     = now()
            from old
            where payment_transactions.id = old.old_id
              and payment_transactions.status = 'PENDING'
            returning {PAYMENT_COLUMNS}, old_transaction_id
            "#
        );
        let row = sqlx::query(&sql)
            .bind(auth_id)
            .bind(settled.spend_amount)
            .bind(&settled.transaction_id)
            .bind(&settled.first_six)
            .bind(&settled.last_four)
            .bind(&settled.auth_code)
            .fetch_optional(&mut *tx)
            .await
            .context("settlement override update failed")?;

        let Some(row) = row else {
            tx.rollback().await.context("rollback override tx")?;
            return Ok(SettlementOverride::NotPending);
        };
        let updated = payment_from_row(&row)?;
        let old_transaction_id: String = row.try_get("old_transaction_id")?;

        sqlx::query(
            r#"
            update transactions
            set spend_amount = $2, transaction_id = $3, first_six = $4,
                last_four = $5, auth_code = $6, updated_at = now()
            where id = $1
            "#,
        )
        .bind(updated.ledger_id)
        .bind(updated.spend_amount)
        .bind(&updated.transaction_id)
        .bind(&updated.first_six)
        .bind(&updated.last_four)
        .bind(&updated.auth_code)
        .execute(&mut *tx)
        .await
        .context("settlement override ledger update failed")?;

        if old_transaction_id != updated.transaction_id {
            sqlx::query(
                r#"
                update user_identities
                set transaction_id = $2, updated_at = now()
                where transaction_id = $1
                  and not exists (select 1 from user_identities where transaction_id = $2)
                "#,
            )
            .bind(&old_transaction_id)
            .bind(&updated.transaction_id)
            .execute(&mut *tx)
            .await
            .context("settlement override identity re-key failed")?;
        }

        tx.commit().await.context("commit override tx")?;
        Ok(SettlementOverride::Applied(updated))
    }

    async fn fetch_payment_transaction(&self, id: i64) -> Result<Option<PaymentTransaction>> {
        let sql = format!("select {PAYMENT_COLUMNS} from payment_transactions where id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_payment_transaction failed")?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn fetch_scheme_transaction(&self, id: i64) -> Result<Option<SchemeTransaction>> {
        let sql = format!("select {SCHEME_COLUMNS} from scheme_transactions where id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_scheme_transaction failed")?;
        row.as_ref().map(scheme_from_row).transpose()
    }

    async fn scheme_transactions_since(
        &self,
        from_date: DateTime<Utc>,
    ) -> Result<Vec<SchemeTransaction>> {
        let sql = format!(
            "select {SCHEME_COLUMNS} from scheme_transactions \
             where created_at >= $1 order by id"
        );
        let rows = sqlx::query(&sql)
            .bind(from_date)
            .fetch_all(&self.pool)
            .await
            .context("scheme_transactions_since failed")?;
        map_rows(&rows, scheme_from_row, "scheme_transactions")
    }

    async fn scheme_transactions_in_group(
        &self,
        match_group: &str,
    ) -> Result<Vec<SchemeTransaction>> {
        let sql = format!(
            "select {SCHEME_COLUMNS} from scheme_transactions \
             where match_group = $1 order by id"
        );
        let rows = sqlx::query(&sql)
            .bind(match_group)
            .fetch_all(&self.pool)
            .await
            .context("scheme_transactions_in_group failed")?;
        map_rows(&rows, scheme_from_row, "scheme_transactions")
    }

    async fn pending_scheme_transactions_for_identifiers(
        &self,
        merchant_identifier_ids: &[i64],
    ) -> Result<Vec<SchemeTransaction>> {
        let sql = format!(
            "select {SCHEME_COLUMNS} from scheme_transactions \
             where status = 'PENDING' and merchant_identifier_ids && $1::bigint[] \
             order by transaction_date, id"
        );
        let rows = sqlx::query(&sql)
            .bind(merchant_identifier_ids)
            .fetch_all(&self.pool)
            .await
            .context("pending_scheme_transactions_for_identifiers failed")?;
        map_rows(&rows, scheme_from_row, "scheme_transactions")
    }

    async fn pending_identified_payment_ids(
        &self,
        merchant_identifier_ids: &[i64],
    ) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            select p.id
            from payment_transactions p
            where p.status = 'PENDING'
              and p.merchant_identifier_ids && $1::bigint[]
              and exists (
                select 1 from user_identities u where u.transaction_id = p.transaction_id
              )
            order by p.id
            "#,
        )
        .bind(merchant_identifier_ids)
        .fetch_all(&self.pool)
        .await
        .context("pending_identified_payment_ids failed")?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}
