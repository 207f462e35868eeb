//! Retry bookkeeping and the periodic sweeps that re-enqueue due work.
//!
//! Every sweep follows the same order: claim the due rows (one statement that
//! bumps `retry_count` and nulls `retry_at`), and only then enqueue. A claimed
//! row cannot be due again until its next failure sets a fresh `retry_at`, so
//! overlapping sweeps never queue the same failure twice.
//!
//! If the enqueue itself fails after the claim, the row is rescheduled with
//! the normal backoff instead of being left unreachable.

use anyhow::Result;
use tracing::{debug, error, info, warn};

use mb_queue::QueueError;
use mb_schemas::{Job, PendingExport, RetryKind};

use crate::backoff::next_retry_at;
use crate::context::PipelineContext;
use crate::export::ExportMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScheduled {
    Scheduled,
    /// `max_*_attempts` reached; no further automatic retry.
    BudgetSpent,
}

/// Record a failure against an identify or matching entity and schedule the
/// next attempt, unless the attempt budget is spent.
pub(crate) async fn schedule_entity_retry(
    ctx: &PipelineContext,
    kind: RetryKind,
    entity_id: i64,
    reason: &str,
    max_attempts: i32,
) -> Result<RetryScheduled> {
    let retry_count = ctx
        .store
        .fetch_retry(kind, entity_id)
        .await?
        .map(|e| e.retry_count)
        .unwrap_or(0);

    if retry_count >= max_attempts {
        warn!(
            kind = %kind,
            entity_id,
            retry_count,
            reason,
            "retry budget spent; leaving for manual follow-up"
        );
        return Ok(RetryScheduled::BudgetSpent);
    }

    let retry_at = next_retry_at(&ctx.settings.retry, retry_count, ctx.now());
    ctx.store
        .schedule_retry(kind, entity_id, reason, retry_at)
        .await?;
    info!(kind = %kind, entity_id, retry_count, %retry_at, reason, "retry scheduled");
    Ok(RetryScheduled::Scheduled)
}

/// Leave a retry entry for an entity whose rows are committed but whose
/// follow-up job could not be queued. The entry is due at once and ignores the
/// attempt budget, since it is the only remaining trace of the job.
pub(crate) async fn defer_unqueued(
    ctx: &PipelineContext,
    kind: RetryKind,
    entity_id: i64,
    err: &QueueError,
) -> Result<()> {
    let now = ctx.now();
    ctx.store
        .schedule_retry(kind, entity_id, &format!("enqueue failed: {err}"), now)
        .await?;
    warn!(
        kind = %kind,
        entity_id,
        error = %err,
        "follow-up job not queued; retry entry left for the sweep"
    );
    Ok(())
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub enqueued: usize,
    /// Batch-mode exports handed back to the batch tick.
    pub deferred_to_batch: usize,
    pub rescheduled: usize,
}

#[derive(Clone)]
pub struct RetrySweeper {
    ctx: PipelineContext,
}

impl RetrySweeper {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Re-attempt every pending export whose `retry_at` has passed.
    pub async fn sweep_exports(&self) -> Result<SweepReport> {
        let now = self.ctx.now();
        let claimed = self.ctx.store.claim_due_exports(now).await?;
        let mut report = SweepReport {
            claimed: claimed.len(),
            ..SweepReport::default()
        };

        for pending in claimed {
            if self.is_batch_provider(&pending) {
                // retry_at is now null, so the next batch tick includes it.
                report.deferred_to_batch += 1;
                continue;
            }
            let job = Job::ExportPending {
                pending_export_id: pending.id,
            };
            match self.ctx.queues.enqueue(job).await {
                Ok(_) => report.enqueued += 1,
                Err(e) => {
                    error!(
                        pending_export_id = pending.id,
                        error = %e,
                        "export retry enqueue failed; rescheduling"
                    );
                    let retry_at =
                        next_retry_at(&self.ctx.settings.retry, pending.retry_count, now);
                    self.ctx
                        .store
                        .fail_export(pending.id, &format!("re-enqueue failed: {e}"), retry_at)
                        .await?;
                    report.rescheduled += 1;
                }
            }
        }

        log_report("export", &report);
        Ok(report)
    }

    pub async fn sweep_identify(&self) -> Result<SweepReport> {
        self.sweep_entities(RetryKind::Identify).await
    }

    pub async fn sweep_matching(&self) -> Result<SweepReport> {
        self.sweep_entities(RetryKind::Matching).await
    }

    async fn sweep_entities(&self, kind: RetryKind) -> Result<SweepReport> {
        let now = self.ctx.now();
        let claimed = self.ctx.store.claim_due_retries(kind, now).await?;
        let mut report = SweepReport {
            claimed: claimed.len(),
            ..SweepReport::default()
        };

        for entry in claimed {
            let job = match kind {
                RetryKind::Identify => Job::IdentifyPayment {
                    payment_transaction_id: entry.entity_id,
                },
                RetryKind::Matching => Job::MatchPayment {
                    payment_transaction_id: entry.entity_id,
                },
            };
            match self.ctx.queues.enqueue(job).await {
                Ok(_) => report.enqueued += 1,
                Err(e) => {
                    error!(
                        kind = %kind,
                        entity_id = entry.entity_id,
                        error = %e,
                        "retry enqueue failed; rescheduling"
                    );
                    let retry_at = next_retry_at(&self.ctx.settings.retry, entry.retry_count, now);
                    self.ctx
                        .store
                        .schedule_retry(
                            kind,
                            entry.entity_id,
                            &format!("re-enqueue failed: {e}"),
                            retry_at,
                        )
                        .await?;
                    report.rescheduled += 1;
                }
            }
        }

        log_report(kind.as_str(), &report);
        Ok(report)
    }

    fn is_batch_provider(&self, pending: &PendingExport) -> bool {
        self.ctx
            .export_agents
            .get(&pending.provider_slug)
            .map(|agent| agent.mode() == ExportMode::Batch)
            .unwrap_or(false)
    }
}

fn log_report(family: &str, report: &SweepReport) {
    if report.claimed == 0 {
        debug!(family, "retry sweep: nothing due");
        return;
    }
    info!(
        family,
        claimed = report.claimed,
        enqueued = report.enqueued,
        deferred_to_batch = report.deferred_to_batch,
        rescheduled = report.rescheduled,
        "retry sweep complete"
    );
}
