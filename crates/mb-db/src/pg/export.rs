use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use mb_schemas::{ExportTransaction, NewExportTransaction, PendingExport, TransactionStatus};

use super::{
    export_from_row, map_rows, pending_export_from_row, PgStore, EXPORT_COLUMNS,
    PENDING_EXPORT_COLUMNS,
};
use crate::store::ExportStore;

/// Move an export, its matched transaction and the ledger rows behind the
/// contributing legs to `status`. Payment and scheme legs themselves only
/// follow on success (they have no failed state).
async fn transition_export_chain(
    conn: &mut PgConnection,
    export_transaction_id: i64,
    status: TransactionStatus,
) -> Result<()> {
    let (matched_id,): (i64,) = sqlx::query_as(
        r#"
        update export_transactions
        set status = $2, updated_at = now()
        where id = $1
        returning matched_transaction_id
        "#,
    )
    .bind(export_transaction_id)
    .bind(status.as_str())
    .fetch_one(&mut *conn)
    .await
    .context("export_transactions transition failed")?;

    let (payment_id, scheme_id): (i64, Option<i64>) = sqlx::query_as(
        r#"
        update matched_transactions
        set status = $2, updated_at = now()
        where id = $1
        returning payment_transaction_id, scheme_transaction_id
        "#,
    )
    .bind(matched_id)
    .bind(status.as_str())
    .fetch_one(&mut *conn)
    .await
    .context("matched_transactions transition failed")?;

    if status == TransactionStatus::Exported {
        sqlx::query(
            "update payment_transactions set status = 'EXPORTED', updated_at = now() where id = $1",
        )
        .bind(payment_id)
        .execute(&mut *conn)
        .await
        .context("payment_transactions export transition failed")?;

        if let Some(scheme_id) = scheme_id {
            sqlx::query(
                "update scheme_transactions set status = 'EXPORTED', updated_at = now() where id = $1",
            )
            .bind(scheme_id)
            .execute(&mut *conn)
            .await
            .context("scheme_transactions export transition failed")?;
        }
    }

    sqlx::query(
        r#"
        update transactions
        set status = $3, updated_at = now()
        where id in (
          select ledger_id from payment_transactions where id = $1
          union
          select ledger_id from scheme_transactions where id = $2
        )
        "#,
    )
    .bind(payment_id)
    .bind(scheme_id)
    .bind(status.as_str())
    .execute(&mut *conn)
    .await
    .context("ledger export transition failed")?;

    Ok(())
}

#[async_trait]
impl ExportStore for PgStore {
    async fn create_export(
        &self,
        export: &NewExportTransaction,
    ) -> Result<Option<PendingExport>> {
        let mut tx = self.pool.begin().await.context("begin create_export tx")?;

        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            insert into export_transactions (
              matched_transaction_id, transaction_id, feed_type, provider_slug,
              primary_identifier, transaction_date, spend_amount, spend_currency,
              loyalty_id, user_id, scheme_account_id, payment_card_account_id,
              first_six, last_four, expiry_month, expiry_year, auth_code,
              approval_code, export_uid, status, extra_fields
            ) values (
              $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
              $16, $17, $18, $19, 'PENDING', $20
            )
            on conflict (matched_transaction_id) do nothing
            returning id
            "#,
        )
        .bind(export.matched_transaction_id)
        .bind(&export.transaction_id)
        .bind(export.feed_type.as_str())
        .bind(&export.provider_slug)
        .bind(&export.primary_identifier)
        .bind(export.transaction_date)
        .bind(export.spend_amount)
        .bind(&export.spend_currency)
        .bind(&export.loyalty_id)
        .bind(export.user_id)
        .bind(export.scheme_account_id)
        .bind(export.payment_card_account_id)
        .bind(&export.first_six)
        .bind(&export.last_four)
        .bind(export.expiry_month)
        .bind(export.expiry_year)
        .bind(&export.auth_code)
        .bind(&export.approval_code)
        .bind(export.export_uid)
        .bind(&export.extra_fields)
        .fetch_optional(&mut *tx)
        .await
        .context("insert export_transactions failed")?;
        let Some((export_id,)) = inserted else {
            return Ok(None);
        };

        let sql = format!(
            r#"
            insert into pending_exports (export_transaction_id, provider_slug)
            values ($1, $2)
            returning {PENDING_EXPORT_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(export_id)
            .bind(&export.provider_slug)
            .fetch_one(&mut *tx)
            .await
            .context("insert pending_exports failed")?;
        let pending = pending_export_from_row(&row)?;

        tx.commit().await.context("commit create_export tx")?;
        Ok(Some(pending))
    }

    async fn fetch_export_transaction(&self, id: i64) -> Result<Option<ExportTransaction>> {
        let sql = format!("select {EXPORT_COLUMNS} from export_transactions where id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_export_transaction failed")?;
        row.as_ref().map(export_from_row).transpose()
    }

    async fn fetch_pending_export(&self, id: i64) -> Result<Option<PendingExport>> {
        let sql = format!("select {PENDING_EXPORT_COLUMNS} from pending_exports where id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_pending_export failed")?;
        row.as_ref().map(pending_export_from_row).transpose()
    }

    async fn complete_export(&self, pending_export_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin complete_export tx")?;

        let deleted: Option<(i64,)> = sqlx::query_as(
            "delete from pending_exports where id = $1 returning export_transaction_id",
        )
        .bind(pending_export_id)
        .fetch_optional(&mut *tx)
        .await
        .context("delete pending_exports failed")?;

        let Some((export_id,)) = deleted else {
            tx.rollback().await.context("rollback complete_export tx")?;
            return Ok(false);
        };

        transition_export_chain(&mut tx, export_id, TransactionStatus::Exported).await?;

        tx.commit().await.context("commit complete_export tx")?;
        Ok(true)
    }

    async fn fail_export(
        &self,
        pending_export_id: i64,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin fail_export tx")?;

        let updated: Option<(i64,)> = sqlx::query_as(
            r#"
            update pending_exports
            set failure_reason = $2, retry_at = $3, updated_at = now()
            where id = $1
            returning export_transaction_id
            "#,
        )
        .bind(pending_export_id)
        .bind(reason)
        .bind(retry_at)
        .fetch_optional(&mut *tx)
        .await
        .context("fail_export update failed")?;

        let Some((export_id,)) = updated else {
            tx.rollback().await.context("rollback fail_export tx")?;
            return Ok(false);
        };

        transition_export_chain(&mut tx, export_id, TransactionStatus::ExportFailed).await?;

        tx.commit().await.context("commit fail_export tx")?;
        Ok(true)
    }

    async fn claim_due_exports(&self, now: DateTime<Utc>) -> Result<Vec<PendingExport>> {
        // The where clause is re-checked against the committed row, so two
        // concurrent sweeps cannot both claim one due retry.
        let sql = format!(
            r#"
            update pending_exports
            set retry_count = retry_count + 1,
                retry_at = null,
                updated_at = now()
            where retry_at is not null and retry_at <= $1
            returning {PENDING_EXPORT_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .context("claim_due_exports failed")?;
        let mut claimed = map_rows(&rows, pending_export_from_row, "pending_exports")?;
        claimed.sort_by_key(|p| p.id);
        Ok(claimed)
    }

    async fn ready_exports_for_provider(
        &self,
        provider_slug: &str,
        limit: i64,
    ) -> Result<Vec<PendingExport>> {
        let sql = format!(
            "select {PENDING_EXPORT_COLUMNS} from pending_exports \
             where provider_slug = $1 and retry_at is null \
             order by id limit $2"
        );
        let rows = sqlx::query(&sql)
            .bind(provider_slug)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("ready_exports_for_provider failed")?;
        map_rows(&rows, pending_export_from_row, "pending_exports")
    }

    async fn count_pending_exports(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("select count(*)::bigint from pending_exports")
            .fetch_one(&self.pool)
            .await
            .context("count_pending_exports failed")?;
        Ok(n)
    }
}
