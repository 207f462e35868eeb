use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;

use mb_schemas::{IdentifierType, MatchedTransaction, MerchantIdentifier, NewMatchedTransaction};

use super::{matched_from_row, PgStore, MATCHED_COLUMNS};
use crate::store::MatchingStore;

#[async_trait]
impl MatchingStore for PgStore {
    async fn merchant_identifiers(&self, ids: &[i64]) -> Result<Vec<MerchantIdentifier>> {
        let rows = sqlx::query(
            r#"
            select m.id, m.identifier, m.identifier_type, m.location_id,
                   m.merchant_internal_id, m.loyalty_scheme_id, s.slug as loyalty_scheme_slug,
                   m.payment_provider_id, p.slug as payment_provider_slug
            from merchant_identifiers m
            join loyalty_schemes s on s.id = m.loyalty_scheme_id
            left join payment_providers p on p.id = m.payment_provider_id
            where m.id = any($1::bigint[])
            order by m.id
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .context("merchant_identifiers failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let identifier_type: String = row.try_get("identifier_type")?;
            out.push(MerchantIdentifier {
                id: row.try_get("id")?,
                identifier: row.try_get("identifier")?,
                identifier_type: IdentifierType::parse(&identifier_type)?,
                location_id: row.try_get("location_id")?,
                merchant_internal_id: row.try_get("merchant_internal_id")?,
                loyalty_scheme_id: row.try_get("loyalty_scheme_id")?,
                loyalty_scheme_slug: row.try_get("loyalty_scheme_slug")?,
                payment_provider_id: row.try_get("payment_provider_id")?,
                payment_provider_slug: row.try_get("payment_provider_slug")?,
            });
        }
        Ok(out)
    }

    async fn persist_match(&self, matched: &NewMatchedTransaction) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await.context("begin persist_match tx")?;

        let payment_ledger: Option<(i64,)> = sqlx::query_as(
            r#"
            update payment_transactions
            set status = 'MATCHED', updated_at = now()
            where id = $1 and status = 'PENDING'
            returning ledger_id
            "#,
        )
        .bind(matched.payment_transaction_id)
        .fetch_optional(&mut *tx)
        .await
        .context("persist_match payment transition failed")?;

        let Some((payment_ledger_id,)) = payment_ledger else {
            tx.rollback().await.context("rollback persist_match tx")?;
            return Ok(None);
        };
        let mut ledger_ids = vec![payment_ledger_id];

        if let Some(scheme_id) = matched.scheme_transaction_id {
            let scheme_ledger: Option<(i64,)> = sqlx::query_as(
                r#"
                update scheme_transactions
                set status = 'MATCHED', updated_at = now()
                where id = $1 and status = 'PENDING'
                returning ledger_id
                "#,
            )
            .bind(scheme_id)
            .fetch_optional(&mut *tx)
            .await
            .context("persist_match scheme transition failed")?;

            match scheme_ledger {
                Some((id,)) => ledger_ids.push(id),
                None => {
                    tx.rollback().await.context("rollback persist_match tx")?;
                    return Ok(None);
                }
            }
        }

        sqlx::query(
            r#"
            update transactions
            set status = 'MATCHED', updated_at = now()
            where id = any($1::bigint[])
            "#,
        )
        .bind(&ledger_ids)
        .execute(&mut *tx)
        .await
        .context("persist_match ledger transition failed")?;

        let (id,): (i64,) = sqlx::query_as(
            r#"
            insert into matched_transactions (
              merchant_identifier_id, primary_identifier, loyalty_scheme_slug,
              transaction_id, transaction_date, spend_amount, spend_multiplier,
              spend_currency, card_token, matching_type, status,
              payment_transaction_id, scheme_transaction_id, extra_fields
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'PENDING', $11, $12, $13
            )
            returning id
            "#,
        )
        .bind(matched.merchant_identifier_id)
        .bind(&matched.primary_identifier)
        .bind(&matched.loyalty_scheme_slug)
        .bind(&matched.transaction_id)
        .bind(matched.transaction_date)
        .bind(matched.spend_amount)
        .bind(matched.spend_multiplier)
        .bind(&matched.spend_currency)
        .bind(&matched.card_token)
        .bind(matched.matching_type.as_str())
        .bind(matched.payment_transaction_id)
        .bind(matched.scheme_transaction_id)
        .bind(&matched.extra_fields)
        .fetch_one(&mut *tx)
        .await
        .context("insert matched_transactions failed")?;

        tx.commit().await.context("commit persist_match tx")?;
        Ok(Some(id))
    }

    async fn fetch_matched_transaction(&self, id: i64) -> Result<Option<MatchedTransaction>> {
        let sql = format!("select {MATCHED_COLUMNS} from matched_transactions where id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_matched_transaction failed")?;
        row.as_ref().map(matched_from_row).transpose()
    }

    async fn fetch_match_for_payment(
        &self,
        payment_transaction_id: i64,
    ) -> Result<Option<MatchedTransaction>> {
        let sql = format!(
            "select {MATCHED_COLUMNS} from matched_transactions \
             where payment_transaction_id = $1 order by id limit 1"
        );
        let row = sqlx::query(&sql)
            .bind(payment_transaction_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_match_for_payment failed")?;
        row.as_ref().map(matched_from_row).transpose()
    }
}
