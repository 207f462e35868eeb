use anyhow::{Context, Result};
use async_trait::async_trait;

use mb_schemas::{ResolvedIdentity, UserIdentity};

use super::{identity_from_row, PgStore, IDENTITY_COLUMNS};
use crate::store::IdentityStore;

#[async_trait]
impl IdentityStore for PgStore {
    async fn fetch_identity(&self, transaction_id: &str) -> Result<Option<UserIdentity>> {
        let sql = format!("select {IDENTITY_COLUMNS} from user_identities where transaction_id = $1");
        let row = sqlx::query(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetch_identity failed")?;
        row.as_ref().map(identity_from_row).transpose()
    }

    async fn insert_identity(
        &self,
        transaction_id: &str,
        identity: &ResolvedIdentity,
    ) -> Result<UserIdentity> {
        let sql = format!(
            r#"
            insert into user_identities (
              transaction_id, loyalty_id, scheme_account_id, user_id,
              payment_card_account_id, first_six, last_four, expiry_month, expiry_year
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            on conflict (transaction_id) do nothing
            returning {IDENTITY_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(transaction_id)
            .bind(&identity.loyalty_id)
            .bind(identity.scheme_account_id)
            .bind(identity.user_id)
            .bind(identity.payment_card_account_id)
            .bind(&identity.first_six)
            .bind(&identity.last_four)
            .bind(identity.expiry_month)
            .bind(identity.expiry_year)
            .fetch_optional(&self.pool)
            .await
            .context("insert_identity failed")?;

        match row {
            Some(r) => identity_from_row(&r),
            None => self
                .fetch_identity(transaction_id)
                .await?
                .with_context(|| format!("identity vanished after conflict: {transaction_id}")),
        }
    }

    async fn attach_card_metadata(
        &self,
        transaction_id: &str,
        identity: &ResolvedIdentity,
    ) -> Result<()> {
        sqlx::query(
            r#"
            update user_identities
            set payment_card_account_id = coalesce(payment_card_account_id, $2),
                first_six    = coalesce(first_six, $3),
                last_four    = coalesce(last_four, $4),
                expiry_month = coalesce(expiry_month, $5),
                expiry_year  = coalesce(expiry_year, $6),
                updated_at   = now()
            where transaction_id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(identity.payment_card_account_id)
        .bind(&identity.first_six)
        .bind(&identity.last_four)
        .bind(identity.expiry_month)
        .bind(identity.expiry_year)
        .execute(&self.pool)
        .await
        .context("attach_card_metadata failed")?;
        Ok(())
    }
}
