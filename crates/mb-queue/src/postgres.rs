use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::warn;

use mb_config::RedeliverySettings;
use mb_schemas::{Job, QueueName};

use crate::{Delivery, JobQueue, QueueError};

/// Queue backed by the `jobs` table.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never receive
/// the same row. A crashed worker's claims are returned to READY by
/// [`PgJobQueue::recover_stale_claims`].
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    redelivery: RedeliverySettings,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, redelivery: RedeliverySettings) -> Self {
        Self { pool, redelivery }
    }

    /// Return claims older than `stale_after` to READY. Returns rows touched.
    pub async fn recover_stale_claims(&self, stale_after: Duration) -> Result<u64, QueueError> {
        let res = sqlx::query(
            r#"
            update jobs
            set status = 'READY', claimed_by = null, claimed_at = null, updated_at = now()
            where status = 'CLAIMED'
              and claimed_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(stale_after.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("recover_stale_claims failed")?;
        Ok(res.rows_affected())
    }

    async fn park(&self, id: i64, error: &str) -> Result<(), QueueError> {
        sqlx::query(
            "update jobs set status = 'DEAD', last_error = $2, updated_at = now() where id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("park job failed")?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: &Job) -> Result<i64, QueueError> {
        let payload = serde_json::to_value(job).map_err(|e| QueueError::Payload(e.to_string()))?;
        let (id,): (i64,) =
            sqlx::query_as("insert into jobs (queue, payload) values ($1, $2) returning id")
                .bind(job.queue().as_str())
                .bind(&payload)
                .fetch_one(&self.pool)
                .await
                .context("enqueue insert failed")?;
        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        worker_id: &str,
    ) -> Result<Option<Delivery>, QueueError> {
        loop {
            let row = sqlx::query(
                r#"
                with next as (
                  select id from jobs
                  where queue = $1 and status = 'READY' and available_at <= now()
                  order by id
                  for update skip locked
                  limit 1
                )
                update jobs j
                set status = 'CLAIMED',
                    attempts = j.attempts + 1,
                    claimed_by = $2,
                    claimed_at = now(),
                    updated_at = now()
                from next
                where j.id = next.id
                returning j.id, j.payload, j.attempts
                "#,
            )
            .bind(queue.as_str())
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await
            .context("dequeue claim failed")?;

            let Some(row) = row else {
                return Ok(None);
            };
            let id: i64 = row.try_get("id").context("decode job id")?;
            let attempts: i32 = row.try_get("attempts").context("decode job attempts")?;
            let payload: serde_json::Value = row.try_get("payload").context("decode job payload")?;

            match serde_json::from_value::<Job>(payload) {
                Ok(job) => {
                    return Ok(Some(Delivery {
                        id,
                        queue,
                        job,
                        attempts,
                    }))
                }
                Err(e) => {
                    // Undecodable payloads can never succeed; park and move on.
                    warn!(job_id = id, queue = %queue, error = %e, "undecodable job parked");
                    self.park(id, &format!("payload decode: {e}")).await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        sqlx::query("delete from jobs where id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await
            .context("ack delete failed")?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, error: &str) -> Result<(), QueueError> {
        if delivery.attempts >= self.redelivery.max_attempts {
            warn!(
                job_id = delivery.id,
                queue = %delivery.queue,
                attempts = delivery.attempts,
                error,
                "job parked after max attempts"
            );
            return self.park(delivery.id, error).await;
        }

        let exp = (delivery.attempts - 1).clamp(0, 16) as u32;
        let delay_secs = self.redelivery.base_delay_secs.saturating_mul(1_i64 << exp);
        sqlx::query(
            r#"
            update jobs
            set status = 'READY',
                claimed_by = null,
                claimed_at = null,
                last_error = $2,
                available_at = now() + make_interval(secs => $3),
                updated_at = now()
            where id = $1
            "#,
        )
        .bind(delivery.id)
        .bind(error)
        .bind(delay_secs as f64)
        .execute(&self.pool)
        .await
        .context("nack update failed")?;
        Ok(())
    }

    async fn len(&self, queue: QueueName) -> Result<u64, QueueError> {
        let (n,): (i64,) = sqlx::query_as(
            "select count(*)::bigint from jobs where queue = $1 and status in ('READY','CLAIMED')",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await
        .context("queue len failed")?;
        Ok(n.max(0) as u64)
    }
}
