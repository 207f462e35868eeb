//! Scheduled batch export.
//!
//! For each batch-mode destination, ready pending exports (not scheduled for
//! retry, not claimed) are shipped in chunks of `export.batch_size`. Each
//! chunk reserves exactly one file sequence number before delivery, so two
//! batches from the same destination can never share a number. A failed chunk
//! keeps its number (a gap) and every export in it is scheduled for retry.

use tracing::{error, info};

use mb_schemas::ExportTransaction;

use super::{ExportAgent, ExportDirector, ExportMode};
use crate::backoff::next_retry_at;
use crate::error::ExportError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub batches: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Sequence numbers used, in order.
    pub sequence_numbers: Vec<i64>,
}

impl ExportDirector {
    pub async fn run_batch_export(&self) -> Result<BatchReport, ExportError> {
        let mut report = BatchReport::default();
        for slug in self.ctx.export_agents.slugs() {
            let agent = self
                .ctx
                .export_agents
                .get(&slug)
                .map_err(ExportError::NotRegistered)?;
            if agent.mode() != ExportMode::Batch {
                continue;
            }
            self.export_provider_batches(slug, agent.as_ref(), &mut report)
                .await?;
        }
        if report.batches > 0 {
            info!(
                batches = report.batches,
                delivered = report.delivered,
                failed = report.failed,
                "batch export complete"
            );
        }
        Ok(report)
    }

    async fn export_provider_batches(
        &self,
        provider_slug: &str,
        agent: &dyn ExportAgent,
        report: &mut BatchReport,
    ) -> Result<(), ExportError> {
        let store = &self.ctx.store;
        let limit = i64::try_from(self.ctx.settings.export.batch_size).unwrap_or(i64::MAX);
        let sequencer = self.sequencer();

        loop {
            let chunk = store.ready_exports_for_provider(provider_slug, limit).await?;
            if chunk.is_empty() {
                return Ok(());
            }

            let mut exports: Vec<ExportTransaction> = Vec::with_capacity(chunk.len());
            for pending in &chunk {
                match store
                    .fetch_export_transaction(pending.export_transaction_id)
                    .await?
                {
                    Some(e) => exports.push(e),
                    None => {
                        return Err(ExportError::ExportTransactionNotFound {
                            id: pending.export_transaction_id,
                        })
                    }
                }
            }

            let sequence_number = sequencer.reserve(provider_slug, 1).await?.start;
            report.batches += 1;
            report.sequence_numbers.push(sequence_number);

            match agent.export_batch(&exports, sequence_number).await {
                Ok(()) => {
                    for pending in &chunk {
                        store.complete_export(pending.id).await?;
                    }
                    report.delivered += chunk.len();
                    info!(
                        provider_slug,
                        sequence_number,
                        exports = chunk.len(),
                        "batch delivered"
                    );
                }
                Err(e) => {
                    let reason = format!("batch {sequence_number}: {e}");
                    let now = self.ctx.now();
                    for pending in &chunk {
                        let retry_at =
                            next_retry_at(&self.ctx.settings.retry, pending.retry_count, now);
                        store.fail_export(pending.id, &reason, retry_at).await?;
                    }
                    report.failed += chunk.len();
                    error!(
                        provider_slug,
                        sequence_number,
                        exports = chunk.len(),
                        error = %e,
                        "batch export failed; retries scheduled"
                    );
                    // Failed rows now carry retry_at, so the next read would
                    // only return newer rows; stop and let the sweep own them.
                    return Ok(());
                }
            }
        }
    }
}
