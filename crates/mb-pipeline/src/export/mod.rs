//! Export director.
//!
//! `handle_export_transaction` snapshots a matched transaction into an export
//! transaction plus its first pending export, in one unit. The pending export
//! is created with `retry_at = null` and only then queued, so it is never due
//! for the retry sweep while the first attempt is in flight.
//!
//! `handle_pending_export` delivers one pending export through the
//! destination's [`ExportAgent`]. Success completes the whole chain; failure
//! records the reason and `retry_at = now + backoff(retry_count)` and leaves
//! `retry_count` for the sweep to advance.

mod agent;
mod batch;

pub use agent::{ExportAgent, ExportMode};
pub use batch::BatchReport;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mb_schemas::{Job, NewExportTransaction, PendingExport};

use crate::backoff::next_retry_at;
use crate::context::PipelineContext;
use crate::error::ExportError;
use crate::sequencer::Sequencer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    /// Snapshot and pending export created. `queued` is false for batch
    /// destinations, which pick the row up on the next batch run.
    Created { pending_export_id: i64, queued: bool },
    /// The matched transaction already has an export.
    AlreadyExported,
    Delivered,
    /// Delivery failed and a retry is scheduled.
    Failed { retry_at: chrono::DateTime<chrono::Utc> },
    /// The pending export no longer exists (completed by an earlier delivery).
    AlreadyComplete,
    /// Destination has no registered agent.
    NoAgent { provider_slug: String },
}

#[derive(Clone)]
pub struct ExportDirector {
    ctx: PipelineContext,
}

impl ExportDirector {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn sequencer(&self) -> Sequencer {
        Sequencer::new(
            self.ctx.store.clone(),
            self.ctx.settings.export.default_sequence_start,
        )
    }

    pub async fn handle_export_transaction(
        &self,
        matched_transaction_id: i64,
    ) -> Result<ExportOutcome, ExportError> {
        let export = self.snapshot(matched_transaction_id).await?;
        let provider_slug = export.provider_slug.clone();

        let Some(pending) = self.ctx.store.create_export(&export).await? else {
            info!(
                matched_transaction_id,
                reason = "matched transaction already exported",
                "export discarded"
            );
            return Ok(ExportOutcome::AlreadyExported);
        };

        let queued = !self.is_batch(&provider_slug);
        if queued {
            self.ctx
                .queues
                .enqueue(Job::ExportPending {
                    pending_export_id: pending.id,
                })
                .await?;
        }
        info!(
            matched_transaction_id,
            pending_export_id = pending.id,
            provider_slug = %provider_slug,
            queued,
            "export created"
        );
        Ok(ExportOutcome::Created {
            pending_export_id: pending.id,
            queued,
        })
    }

    pub async fn handle_pending_export(
        &self,
        pending_export_id: i64,
    ) -> Result<ExportOutcome, ExportError> {
        let store = &self.ctx.store;
        let Some(pending) = store.fetch_pending_export(pending_export_id).await? else {
            debug!(pending_export_id, "pending export already complete");
            return Ok(ExportOutcome::AlreadyComplete);
        };

        let agent = match self.ctx.export_agents.get(&pending.provider_slug) {
            Ok(agent) => agent,
            Err(e) => {
                warn!(
                    pending_export_id,
                    provider_slug = %pending.provider_slug,
                    "export skipped: no export agent registered"
                );
                if self.ctx.debug().enabled() {
                    return Err(ExportError::NotRegistered(e));
                }
                return Ok(ExportOutcome::NoAgent {
                    provider_slug: pending.provider_slug,
                });
            }
        };

        let Some(export) = store
            .fetch_export_transaction(pending.export_transaction_id)
            .await?
        else {
            return Err(ExportError::ExportTransactionNotFound {
                id: pending.export_transaction_id,
            });
        };

        match agent.export(&export, &pending).await {
            Ok(()) => {
                if !store.complete_export(pending.id).await? {
                    debug!(pending_export_id, "pending export completed concurrently");
                    return Ok(ExportOutcome::AlreadyComplete);
                }
                info!(
                    pending_export_id,
                    export_transaction_id = export.id,
                    provider_slug = %pending.provider_slug,
                    retry_count = pending.retry_count,
                    "export delivered"
                );
                Ok(ExportOutcome::Delivered)
            }
            Err(source) => {
                let retry_at = self.record_failure(&pending, &source.to_string()).await?;
                if self.ctx.debug().enabled() {
                    return Err(ExportError::Agent {
                        provider_slug: pending.provider_slug,
                        source,
                    });
                }
                Ok(ExportOutcome::Failed { retry_at })
            }
        }
    }

    async fn record_failure(
        &self,
        pending: &PendingExport,
        reason: &str,
    ) -> Result<chrono::DateTime<chrono::Utc>, ExportError> {
        let retry_at = next_retry_at(&self.ctx.settings.retry, pending.retry_count, self.ctx.now());
        self.ctx
            .store
            .fail_export(pending.id, reason, retry_at)
            .await?;
        error!(
            pending_export_id = pending.id,
            provider_slug = %pending.provider_slug,
            retry_count = pending.retry_count,
            %retry_at,
            reason,
            "export failed; retry scheduled"
        );
        Ok(retry_at)
    }

    async fn snapshot(&self, matched_transaction_id: i64) -> Result<NewExportTransaction, ExportError> {
        let store = &self.ctx.store;
        let Some(matched) = store.fetch_matched_transaction(matched_transaction_id).await? else {
            return Err(ExportError::MatchedTransactionNotFound {
                id: matched_transaction_id,
            });
        };
        let m = matched.fields;

        let payment = store
            .fetch_payment_transaction(m.payment_transaction_id)
            .await?;
        let identity = match &payment {
            Some(p) => store.fetch_identity(&p.transaction_id).await?,
            None => None,
        };
        let ident = identity.map(|u| u.identity);

        // Card fields: identity service first, payment leg as fallback.
        let first_six = ident
            .as_ref()
            .and_then(|i| i.first_six.clone())
            .or_else(|| payment.as_ref().and_then(|p| p.first_six.clone()));
        let last_four = ident
            .as_ref()
            .and_then(|i| i.last_four.clone())
            .or_else(|| payment.as_ref().and_then(|p| p.last_four.clone()));

        Ok(NewExportTransaction {
            matched_transaction_id: matched.id,
            transaction_id: m.transaction_id,
            feed_type: payment
                .as_ref()
                .map(|p| p.feed_type)
                .unwrap_or(mb_schemas::FeedType::Settled),
            provider_slug: m.loyalty_scheme_slug,
            primary_identifier: m.primary_identifier,
            transaction_date: m.transaction_date,
            spend_amount: m.spend_amount,
            spend_currency: m.spend_currency,
            loyalty_id: ident.as_ref().map(|i| i.loyalty_id.clone()),
            user_id: ident.as_ref().map(|i| i.user_id),
            scheme_account_id: ident.as_ref().map(|i| i.scheme_account_id),
            payment_card_account_id: ident.as_ref().and_then(|i| i.payment_card_account_id),
            first_six,
            last_four,
            expiry_month: ident.as_ref().and_then(|i| i.expiry_month),
            expiry_year: ident.as_ref().and_then(|i| i.expiry_year),
            auth_code: payment
                .as_ref()
                .map(|p| p.auth_code.clone())
                .unwrap_or_default(),
            approval_code: payment
                .as_ref()
                .map(|p| p.approval_code.clone())
                .unwrap_or_default(),
            export_uid: Uuid::new_v4(),
            extra_fields: m.extra_fields,
        })
    }

    fn is_batch(&self, provider_slug: &str) -> bool {
        self.ctx
            .export_agents
            .get(provider_slug)
            .map(|a| a.mode() == ExportMode::Batch)
            .unwrap_or(false)
    }
}
