//! Identification: attach a loyalty-member identity to a payment leg.
//!
//! The identity service is an external collaborator behind
//! [`IdentityResolver`]. A leg that resolves is queued for matching; a leg the
//! service does not recognise stays PENDING (a later import or operator action
//! may change that); a service fault schedules an identify retry.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use mb_schemas::{Job, PaymentTransaction, ResolvedIdentity, RetryKind};

use crate::context::PipelineContext;
use crate::error::IdentifyError;
use crate::retry::{schedule_entity_retry, RetryScheduled};

/// External identity lookup.
///
/// `Ok(None)` means the card is not enrolled; `Err` is a service fault and is
/// retried.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, payment: &PaymentTransaction)
        -> anyhow::Result<Option<ResolvedIdentity>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifyOutcome {
    /// Identity stored and the leg queued for matching.
    Identified,
    /// An identity already existed; the leg was queued for matching again.
    AlreadyIdentified,
    /// Leg has left PENDING; nothing to do.
    NotPending,
    /// Service does not know the card.
    Unidentifiable,
    /// Service fault; a retry is scheduled (or the retry budget is spent).
    Deferred(RetryScheduled),
}

#[derive(Clone)]
pub struct IdentifyDirector {
    ctx: PipelineContext,
}

impl IdentifyDirector {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn identify_payment_transaction(
        &self,
        payment_transaction_id: i64,
    ) -> Result<IdentifyOutcome, IdentifyError> {
        let store = &self.ctx.store;
        let Some(payment) = store.fetch_payment_transaction(payment_transaction_id).await? else {
            return Err(IdentifyError::TransactionNotFound {
                id: payment_transaction_id,
            });
        };
        if !payment.is_pending() {
            debug!(
                payment_transaction_id,
                status = %payment.status,
                "identify skipped: not pending"
            );
            return Ok(IdentifyOutcome::NotPending);
        }

        if store.fetch_identity(&payment.transaction_id).await?.is_some() {
            self.queue_match(payment_transaction_id).await?;
            return Ok(IdentifyOutcome::AlreadyIdentified);
        }

        match self.ctx.identity_resolver.resolve(&payment).await {
            Ok(Some(identity)) => {
                store
                    .insert_identity(&payment.transaction_id, &identity)
                    .await?;
                store
                    .clear_retry(RetryKind::Identify, payment_transaction_id)
                    .await?;
                self.queue_match(payment_transaction_id).await?;
                info!(
                    payment_transaction_id,
                    transaction_id = %payment.transaction_id,
                    loyalty_id = %identity.loyalty_id,
                    "payment transaction identified"
                );
                Ok(IdentifyOutcome::Identified)
            }
            Ok(None) => {
                store
                    .clear_retry(RetryKind::Identify, payment_transaction_id)
                    .await?;
                info!(
                    payment_transaction_id,
                    transaction_id = %payment.transaction_id,
                    reason = "card not enrolled",
                    "payment transaction left unidentified"
                );
                Ok(IdentifyOutcome::Unidentifiable)
            }
            Err(source) => {
                let reason = format!("{source:#}");
                warn!(
                    payment_transaction_id,
                    reason = %reason,
                    "identity resolver failed"
                );
                let scheduled = schedule_entity_retry(
                    &self.ctx,
                    RetryKind::Identify,
                    payment_transaction_id,
                    &reason,
                    self.ctx.settings.retry.max_identify_attempts,
                )
                .await?;
                if self.ctx.debug().enabled() {
                    return Err(IdentifyError::Resolver {
                        id: payment_transaction_id,
                        source,
                    });
                }
                Ok(IdentifyOutcome::Deferred(scheduled))
            }
        }
    }

    async fn queue_match(&self, payment_transaction_id: i64) -> Result<(), IdentifyError> {
        self.ctx
            .queues
            .enqueue(Job::MatchPayment {
                payment_transaction_id,
            })
            .await?;
        Ok(())
    }
}
