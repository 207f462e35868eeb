use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

use mb_schemas::{RetryEntry, RetryKind};

use super::{map_rows, PgStore};
use crate::is_unique_constraint_violation;
use crate::store::{
    ConfigStore, LockStore, NewMerchantIdentifier, ReferenceStore, RetryStore, SequenceStore,
};

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

#[async_trait]
impl SequenceStore for PgStore {
    async fn next_value(&self, provider_slug: &str, default: i64) -> Result<i64> {
        sqlx::query(
            r#"
            insert into file_sequence_numbers (provider_slug, next_value)
            values ($1, $2)
            on conflict (provider_slug) do nothing
            "#,
        )
        .bind(provider_slug)
        .bind(default)
        .execute(&self.pool)
        .await
        .context("sequence get-or-create failed")?;

        let (value,): (i64,) = sqlx::query_as(
            "select next_value from file_sequence_numbers where provider_slug = $1",
        )
        .bind(provider_slug)
        .fetch_one(&self.pool)
        .await
        .context("sequence read failed")?;
        Ok(value)
    }

    async fn set_next_value(&self, provider_slug: &str, value: i64) -> Result<()> {
        sqlx::query(
            r#"
            insert into file_sequence_numbers (provider_slug, next_value)
            values ($1, $2)
            on conflict (provider_slug)
            do update set next_value = excluded.next_value, updated_at = now()
            "#,
        )
        .bind(provider_slug)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("set_next_value failed")?;
        Ok(())
    }

    async fn reserve_sequence(
        &self,
        provider_slug: &str,
        count: i64,
        default: i64,
    ) -> Result<i64> {
        // Row lock from the upsert serialises concurrent reservations.
        let (start,): (i64,) = sqlx::query_as(
            r#"
            insert into file_sequence_numbers (provider_slug, next_value)
            values ($1, $2 + $3)
            on conflict (provider_slug)
            do update set next_value = file_sequence_numbers.next_value + $3,
                          updated_at = now()
            returning next_value - $3
            "#,
        )
        .bind(provider_slug)
        .bind(default)
        .bind(count)
        .fetch_one(&self.pool)
        .await
        .context("reserve_sequence failed")?;
        Ok(start)
    }
}

// ---------------------------------------------------------------------------
// Config items
// ---------------------------------------------------------------------------

#[async_trait]
impl ConfigStore for PgStore {
    async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("select value from config_items where key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("get_config failed")?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            insert into config_items (key, value) values ($1, $2)
            on conflict (key) do update set value = excluded.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("set_config failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retry entries
// ---------------------------------------------------------------------------

fn retry_from_row(row: &PgRow) -> Result<RetryEntry> {
    let kind: String = row.try_get("kind")?;
    Ok(RetryEntry {
        kind: RetryKind::parse(&kind)?,
        entity_id: row.try_get("entity_id")?,
        retry_count: row.try_get("retry_count")?,
        retry_at: row.try_get("retry_at")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

#[async_trait]
impl RetryStore for PgStore {
    async fn fetch_retry(&self, kind: RetryKind, entity_id: i64) -> Result<Option<RetryEntry>> {
        let row = sqlx::query(
            r#"
            select kind, entity_id, retry_count, retry_at, failure_reason
            from retry_entries where kind = $1 and entity_id = $2
            "#,
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetch_retry failed")?;
        row.as_ref().map(retry_from_row).transpose()
    }

    async fn schedule_retry(
        &self,
        kind: RetryKind,
        entity_id: i64,
        reason: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            insert into retry_entries (kind, entity_id, retry_at, failure_reason)
            values ($1, $2, $3, $4)
            on conflict (kind, entity_id)
            do update set retry_at = excluded.retry_at,
                          failure_reason = excluded.failure_reason,
                          updated_at = now()
            "#,
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(retry_at)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("schedule_retry failed")?;
        Ok(())
    }

    async fn claim_due_retries(
        &self,
        kind: RetryKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetryEntry>> {
        let rows = sqlx::query(
            r#"
            update retry_entries
            set retry_count = retry_count + 1,
                retry_at = null,
                updated_at = now()
            where kind = $1 and retry_at is not null and retry_at <= $2
            returning kind, entity_id, retry_count, retry_at, failure_reason
            "#,
        )
        .bind(kind.as_str())
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("claim_due_retries failed")?;
        let mut claimed = map_rows(&rows, retry_from_row, "retry_entries")?;
        claimed.sort_by_key(|r| r.entity_id);
        Ok(claimed)
    }

    async fn clear_retry(&self, kind: RetryKind, entity_id: i64) -> Result<()> {
        sqlx::query("delete from retry_entries where kind = $1 and entity_id = $2")
            .bind(kind.as_str())
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .context("clear_retry failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Leader locks
// ---------------------------------------------------------------------------

#[async_trait]
impl LockStore for PgStore {
    async fn try_acquire_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        // One statement: the conflict branch only fires for the current
        // owner or an expired holder, so two contenders cannot both win.
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            insert into leader_locks (name, owner, expires_at)
            values ($1, $2, now() + make_interval(secs => $3))
            on conflict (name) do update
              set owner = excluded.owner,
                  expires_at = excluded.expires_at,
                  updated_at = now()
              where leader_locks.owner = excluded.owner
                 or leader_locks.expires_at <= now()
            returning owner
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .context("try_acquire_lock failed")?;
        Ok(row.is_some())
    }

    async fn release_lock(&self, name: &str, owner: &str) -> Result<()> {
        sqlx::query("delete from leader_locks where name = $1 and owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await
            .context("release_lock failed")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reference data
// ---------------------------------------------------------------------------

#[async_trait]
impl ReferenceStore for PgStore {
    async fn insert_merchant_identifier(&self, mid: &NewMerchantIdentifier) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("begin merchant identifier tx")?;

        let (scheme_id,): (i64,) = sqlx::query_as(
            r#"
            insert into loyalty_schemes (slug) values ($1)
            on conflict (slug) do update set slug = excluded.slug
            returning id
            "#,
        )
        .bind(&mid.loyalty_scheme_slug)
        .fetch_one(&mut *tx)
        .await
        .context("upsert loyalty_schemes failed")?;

        let provider_id: Option<i64> = match &mid.payment_provider_slug {
            Some(slug) => {
                let (id,): (i64,) = sqlx::query_as(
                    r#"
                    insert into payment_providers (slug) values ($1)
                    on conflict (slug) do update set slug = excluded.slug
                    returning id
                    "#,
                )
                .bind(slug)
                .fetch_one(&mut *tx)
                .await
                .context("upsert payment_providers failed")?;
                Some(id)
            }
            None => None,
        };

        let res = sqlx::query_as::<_, (i64,)>(
            r#"
            insert into merchant_identifiers (
              identifier, identifier_type, location_id, merchant_internal_id,
              loyalty_scheme_id, payment_provider_id
            ) values ($1, $2, $3, $4, $5, $6)
            returning id
            "#,
        )
        .bind(&mid.identifier)
        .bind(mid.identifier_type.as_str())
        .bind(&mid.location_id)
        .bind(&mid.merchant_internal_id)
        .bind(scheme_id)
        .bind(provider_id)
        .fetch_one(&mut *tx)
        .await;

        let id = match res {
            Ok((id,)) => id,
            Err(e) if is_unique_constraint_violation(&e, "uq_merchant_identifier") => {
                return Err(anyhow!(
                    "merchant identifier already exists: {} {} scheme={}",
                    mid.identifier,
                    mid.identifier_type,
                    mid.loyalty_scheme_slug
                ));
            }
            Err(e) => return Err(anyhow::Error::new(e).context("insert merchant_identifiers failed")),
        };

        tx.commit().await.context("commit merchant identifier tx")?;
        Ok(id)
    }
}
