//! Matching engine.
//!
//! `handle_payment_transaction` correlates one identified payment leg with its
//! scheme leg through the scheme's registered [`MatchingAgent`]. The reverse
//! direction (`handle_scheme_transactions*`) finds PENDING, identified payment
//! legs whose merchant identifiers overlap newly arrived scheme legs and
//! queues each of them for matching again.
//!
//! Persisting a match is a conditional PENDING -> MATCHED transition, so a
//! redelivered job or a concurrent worker can never produce a second matched
//! transaction for the same leg.

mod agent;
mod field_agent;

pub use agent::{MatchContext, MatchError, MatchResult, MatchingAgent};
pub use field_agent::{FieldMatchMode, FieldMatchingAgent};

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use mb_schemas::{Job, PaymentTransactionStatus, RetryKind, SchemeTransaction};

use crate::context::PipelineContext;
use crate::error::{AgentError, MatchingError};
use crate::retry::{defer_unqueued, schedule_entity_retry, RetryScheduled};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { matched_transaction_id: i64 },
    /// Leg was already MATCHED but its export job had not been queued.
    ExportRequeued { matched_transaction_id: i64 },
    /// Leg already left PENDING (redelivery or a concurrent worker).
    NotPending,
    /// No merchant identifier resolves to a scheme.
    NoScheme,
    /// Waiting for identification, which queues the match itself.
    Unidentified,
    /// Scheme has no registered agent.
    NoAgent { scheme_slug: String },
    NoMatch(RetryScheduled),
    AgentFault(RetryScheduled),
}

#[derive(Clone)]
pub struct MatchingDirector {
    ctx: PipelineContext,
}

impl MatchingDirector {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn handle_payment_transaction(
        &self,
        payment_transaction_id: i64,
    ) -> Result<MatchOutcome, MatchingError> {
        let store = &self.ctx.store;
        let Some(payment) = store.fetch_payment_transaction(payment_transaction_id).await? else {
            return Err(MatchingError::TransactionNotFound {
                id: payment_transaction_id,
            });
        };
        if !payment.is_pending() {
            // A retry entry on a MATCHED leg means its export job was never queued.
            if payment.status == PaymentTransactionStatus::Matched
                && store
                    .fetch_retry(RetryKind::Matching, payment_transaction_id)
                    .await?
                    .is_some()
            {
                return self.requeue_export(payment_transaction_id).await;
            }
            info!(
                payment_transaction_id,
                status = %payment.status,
                "match skipped: not pending"
            );
            return Ok(MatchOutcome::NotPending);
        }

        let mids = store
            .merchant_identifiers(&payment.merchant_identifier_ids)
            .await?;
        let slugs: BTreeSet<&str> = mids
            .iter()
            .map(|m| m.loyalty_scheme_slug.as_str())
            .collect();
        if slugs.len() > 1 {
            let slugs: Vec<String> = slugs.iter().map(|s| s.to_string()).collect();
            error!(
                payment_transaction_id,
                slugs = ?slugs,
                "payment transaction spans multiple loyalty schemes"
            );
            return Err(MatchingError::MultipleSchemes {
                payment_transaction_id,
                slugs,
            });
        }
        let Some(scheme_slug) = slugs.first().map(|s| s.to_string()) else {
            warn!(
                payment_transaction_id,
                merchant_identifier_ids = ?payment.merchant_identifier_ids,
                "match skipped: no merchant identifier resolves to a scheme"
            );
            return Ok(MatchOutcome::NoScheme);
        };

        let Some(identity) = store.fetch_identity(&payment.transaction_id).await? else {
            info!(
                payment_transaction_id,
                reason = "not identified",
                "match deferred"
            );
            return Ok(MatchOutcome::Unidentified);
        };

        let agent = match self.ctx.matching_agents.get(&scheme_slug) {
            Ok(agent) => agent,
            Err(e) => {
                warn!(
                    payment_transaction_id,
                    scheme_slug = %scheme_slug,
                    "match skipped: no matching agent registered"
                );
                if self.ctx.debug().enabled() {
                    return Err(MatchingError::NotRegistered(e));
                }
                return Ok(MatchOutcome::NoAgent { scheme_slug });
            }
        };

        let cx = MatchContext {
            payment: &payment,
            identity: &identity,
            merchant_identifiers: &mids,
            scheme_slug: &scheme_slug,
            store: &**store,
        };
        match agent.find_match(&cx).await {
            Ok(result) => {
                let mut matched = result.matched_transaction;
                matched.payment_transaction_id = payment.id;
                matched.scheme_transaction_id = result.scheme_transaction_id;

                let Some(matched_transaction_id) = store.persist_match(&matched).await? else {
                    return self.lost_race(payment_transaction_id).await;
                };
                store
                    .clear_retry(RetryKind::Matching, payment_transaction_id)
                    .await?;
                let job = Job::ExportMatched {
                    matched_transaction_id,
                };
                if let Err(e) = self.ctx.queues.enqueue(job).await {
                    defer_unqueued(&self.ctx, RetryKind::Matching, payment_transaction_id, &e)
                        .await?;
                    return Err(e.into());
                }
                info!(
                    payment_transaction_id,
                    matched_transaction_id,
                    scheme_transaction_id = ?matched.scheme_transaction_id,
                    matching_type = %matched.matching_type,
                    scheme_slug = %scheme_slug,
                    "payment transaction matched"
                );
                Ok(MatchOutcome::Matched {
                    matched_transaction_id,
                })
            }
            Err(MatchError::NoMatch { reason }) => {
                info!(
                    payment_transaction_id,
                    scheme_slug = %scheme_slug,
                    reason = %reason,
                    "no match yet"
                );
                let scheduled = self.schedule_retry(payment_transaction_id, &reason).await?;
                Ok(MatchOutcome::NoMatch(scheduled))
            }
            Err(MatchError::Fault(source)) => {
                let err = AgentError {
                    scheme_slug: scheme_slug.clone(),
                    payment_transaction_id,
                    source,
                };
                error!(payment_transaction_id, error = %err, "matching agent failed");
                let scheduled = self
                    .schedule_retry(payment_transaction_id, &err.to_string())
                    .await?;
                if self.ctx.debug().enabled() {
                    return Err(MatchingError::Agent(err));
                }
                Ok(MatchOutcome::AgentFault(scheduled))
            }
        }
    }

    /// Re-queue identified PENDING payment legs that overlap scheme legs
    /// created at or after `from_date`. Returns the queued payment ids.
    pub async fn handle_scheme_transactions(
        &self,
        from_date: DateTime<Utc>,
    ) -> Result<Vec<i64>, MatchingError> {
        let schemes = self.ctx.store.scheme_transactions_since(from_date).await?;
        self.requeue_overlapping(&schemes, &format!("since {from_date}"))
            .await
    }

    /// Group-scoped [`handle_scheme_transactions`](Self::handle_scheme_transactions).
    pub async fn handle_scheme_transactions_in_group(
        &self,
        match_group: &str,
    ) -> Result<Vec<i64>, MatchingError> {
        let schemes = self
            .ctx
            .store
            .scheme_transactions_in_group(match_group)
            .await?;
        self.requeue_overlapping(&schemes, match_group).await
    }

    async fn requeue_overlapping(
        &self,
        schemes: &[SchemeTransaction],
        scope: &str,
    ) -> Result<Vec<i64>, MatchingError> {
        let mids: BTreeSet<i64> = schemes
            .iter()
            .flat_map(|s| s.merchant_identifier_ids.iter().copied())
            .collect();
        if mids.is_empty() {
            return Ok(Vec::new());
        }
        let mids: Vec<i64> = mids.into_iter().collect();

        let payment_ids = self
            .ctx
            .store
            .pending_identified_payment_ids(&mids)
            .await?;
        for &payment_transaction_id in &payment_ids {
            self.ctx
                .queues
                .enqueue(Job::MatchPayment {
                    payment_transaction_id,
                })
                .await?;
        }
        info!(
            scope,
            scheme_transactions = schemes.len(),
            requeued = payment_ids.len(),
            "scheme rescan complete"
        );
        Ok(payment_ids)
    }

    /// `persist_match` refused: either this leg or the chosen scheme leg left
    /// PENDING. Only the second case still needs matching.
    async fn lost_race(&self, payment_transaction_id: i64) -> Result<MatchOutcome, MatchingError> {
        let still_pending = self
            .ctx
            .store
            .fetch_payment_transaction(payment_transaction_id)
            .await?
            .is_some_and(|p| p.is_pending());
        if !still_pending {
            info!(
                payment_transaction_id,
                reason = "leg left PENDING concurrently",
                "match discarded"
            );
            return Ok(MatchOutcome::NotPending);
        }
        let reason = "scheme leg matched concurrently";
        info!(payment_transaction_id, reason, "match discarded");
        let scheduled = self.schedule_retry(payment_transaction_id, reason).await?;
        Ok(MatchOutcome::NoMatch(scheduled))
    }

    /// Queue the export a committed match still owes, then drop the marker.
    async fn requeue_export(
        &self,
        payment_transaction_id: i64,
    ) -> Result<MatchOutcome, MatchingError> {
        let store = &self.ctx.store;
        let Some(matched) = store.fetch_match_for_payment(payment_transaction_id).await? else {
            store
                .clear_retry(RetryKind::Matching, payment_transaction_id)
                .await?;
            return Ok(MatchOutcome::NotPending);
        };
        let job = Job::ExportMatched {
            matched_transaction_id: matched.id,
        };
        if let Err(e) = self.ctx.queues.enqueue(job).await {
            defer_unqueued(&self.ctx, RetryKind::Matching, payment_transaction_id, &e).await?;
            return Err(e.into());
        }
        store
            .clear_retry(RetryKind::Matching, payment_transaction_id)
            .await?;
        info!(
            payment_transaction_id,
            matched_transaction_id = matched.id,
            "export re-queued for matched transaction"
        );
        Ok(MatchOutcome::ExportRequeued {
            matched_transaction_id: matched.id,
        })
    }

    async fn schedule_retry(
        &self,
        payment_transaction_id: i64,
        reason: &str,
    ) -> Result<RetryScheduled, MatchingError> {
        Ok(schedule_entity_retry(
            &self.ctx,
            RetryKind::Matching,
            payment_transaction_id,
            reason,
            self.ctx.settings.retry.max_matching_attempts,
        )
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Duration;
    use mb_db::{IdentityStore, MatchingStore, RetryStore, TransactionStore};
    use crate::test_support::{harness, harness_with, Harness};
    use mb_schemas::{FeedType, MatchedTransactionStatus, PaymentTransactionStatus, QueueName};
    use mb_testkit::{identity, merchant_identifier, ts, RecordBuilder};

    async fn identified_payment(h: &Harness, mids: &[i64], amount: i64) -> i64 {
        let rec = RecordBuilder::new("visa", "P1", FeedType::Settled)
            .merchant_identifiers(mids)
            .amount(amount)
            .build();
        let p = h
            .store
            .insert_payment_transaction("g", &rec)
            .await
            .unwrap()
            .unwrap();
        h.store
            .insert_identity(&p.transaction_id, &identity("L-1"))
            .await
            .unwrap();
        p.id
    }

    async fn scheme_leg(h: &Harness, mid: i64, amount: i64) -> i64 {
        let rec = RecordBuilder::new("iceland", "S1", FeedType::Merchant)
            .merchant_identifiers(&[mid])
            .amount(amount)
            .build();
        h.store.insert_scheme_transactions("g", &[rec]).await.unwrap()[0]
    }

    #[tokio::test]
    async fn match_persists_and_queues_export() {
        let h = harness().with_field_agent("iceland");
        let mid = merchant_identifier(h.store.as_ref(), "iceland", "MID-1").await.unwrap();
        let sid = scheme_leg(&h, mid, 500).await;
        let pid = identified_payment(&h, &[mid], 500).await;

        let out = h.matching().handle_payment_transaction(pid).await.unwrap();
        let MatchOutcome::Matched {
            matched_transaction_id,
        } = out
        else {
            panic!("expected match, got {out:?}");
        };

        let matched = h
            .store
            .fetch_matched_transaction(matched_transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(matched.status, MatchedTransactionStatus::Pending);
        assert_eq!(matched.fields.payment_transaction_id, pid);
        assert_eq!(matched.fields.scheme_transaction_id, Some(sid));
        let payment = h.store.fetch_payment_transaction(pid).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentTransactionStatus::Matched);
        assert_eq!(
            h.queue.jobs(QueueName::Export),
            vec![Job::ExportMatched {
                matched_transaction_id
            }]
        );
    }

    #[tokio::test]
    async fn redelivery_after_match_is_a_no_op() {
        let h = harness().with_field_agent("iceland");
        let mid = merchant_identifier(h.store.as_ref(), "iceland", "MID-1").await.unwrap();
        scheme_leg(&h, mid, 500).await;
        let pid = identified_payment(&h, &[mid], 500).await;
        let matching = h.matching();

        matching.handle_payment_transaction(pid).await.unwrap();
        let out = matching.handle_payment_transaction(pid).await.unwrap();
        assert_eq!(out, MatchOutcome::NotPending);
        assert_eq!(h.store.matched_transactions().len(), 1);
        assert_eq!(h.queue.jobs(QueueName::Export).len(), 1);
    }

    #[tokio::test]
    async fn unqueued_export_is_requeued_on_redelivery() {
        let h = harness_with(|s| s.queues.enqueue_retry.max_attempts = 0)
            .with_field_agent("iceland");
        let mid = merchant_identifier(h.store.as_ref(), "iceland", "MID-1").await.unwrap();
        scheme_leg(&h, mid, 500).await;
        let pid = identified_payment(&h, &[mid], 500).await;
        let matching = h.matching();

        h.queue.fail_next_enqueues(1);
        let err = matching.handle_payment_transaction(pid).await.unwrap_err();
        assert!(matches!(err, MatchingError::Queue(_)));
        let payment = h.store.fetch_payment_transaction(pid).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentTransactionStatus::Matched);
        assert!(h.queue.jobs(QueueName::Export).is_empty());
        assert!(h
            .store
            .fetch_retry(RetryKind::Matching, pid)
            .await
            .unwrap()
            .is_some());

        let matched_transaction_id = h.store.matched_transactions()[0].id;
        let out = matching.handle_payment_transaction(pid).await.unwrap();
        assert_eq!(
            out,
            MatchOutcome::ExportRequeued {
                matched_transaction_id
            }
        );
        assert_eq!(
            h.queue.jobs(QueueName::Export),
            vec![Job::ExportMatched {
                matched_transaction_id
            }]
        );
        assert!(h
            .store
            .fetch_retry(RetryKind::Matching, pid)
            .await
            .unwrap()
            .is_none());

        let out = matching.handle_payment_transaction(pid).await.unwrap();
        assert_eq!(out, MatchOutcome::NotPending);
        assert_eq!(h.queue.jobs(QueueName::Export).len(), 1);
        assert_eq!(h.store.matched_transactions().len(), 1);
    }

    /// Lets a rival payment leg claim the scheme leg between the agent's
    /// read and the persist.
    struct RivalClaimsSchemeLeg {
        inner: FieldMatchingAgent,
        rival_payment_id: i64,
    }

    #[async_trait]
    impl MatchingAgent for RivalClaimsSchemeLeg {
        async fn find_match(&self, cx: &MatchContext<'_>) -> Result<MatchResult, MatchError> {
            let result = self.inner.find_match(cx).await?;
            let mut rival = result.matched_transaction.clone();
            rival.payment_transaction_id = self.rival_payment_id;
            rival.scheme_transaction_id = result.scheme_transaction_id;
            cx.store.persist_match(&rival).await?;
            Ok(result)
        }
    }

    #[tokio::test]
    async fn scheme_leg_taken_concurrently_schedules_a_retry() {
        let h = harness();
        let mid = merchant_identifier(h.store.as_ref(), "iceland", "MID-1").await.unwrap();
        scheme_leg(&h, mid, 500).await;
        let pid = identified_payment(&h, &[mid], 500).await;
        let rival = RecordBuilder::new("visa", "P2", FeedType::Settled)
            .merchant_identifiers(&[mid])
            .amount(500)
            .build();
        let rival = h
            .store
            .insert_payment_transaction("g", &rival)
            .await
            .unwrap()
            .unwrap();
        let agent = RivalClaimsSchemeLeg {
            inner: FieldMatchingAgent::new(Duration::hours(24), FieldMatchMode::Loyalty),
            rival_payment_id: rival.id,
        };
        let h = h.with_matching_agent("iceland", Arc::new(agent));

        let out = h.matching().handle_payment_transaction(pid).await.unwrap();
        assert_eq!(out, MatchOutcome::NoMatch(RetryScheduled::Scheduled));
        let payment = h.store.fetch_payment_transaction(pid).await.unwrap().unwrap();
        assert!(payment.is_pending());
        let entry = h
            .store
            .fetch_retry(RetryKind::Matching, pid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            entry.failure_reason.as_deref(),
            Some("scheme leg matched concurrently")
        );
        assert!(h.queue.jobs(QueueName::Export).is_empty());
    }

    #[tokio::test]
    async fn two_schemes_is_a_data_quality_fault() {
        let h = harness().with_field_agent("iceland");
        let a = merchant_identifier(h.store.as_ref(), "iceland", "MID-A").await.unwrap();
        let b = merchant_identifier(h.store.as_ref(), "wasabi", "MID-B").await.unwrap();
        let pid = identified_payment(&h, &[a, b], 500).await;

        let err = h.matching().handle_payment_transaction(pid).await.unwrap_err();
        match &err {
            MatchingError::MultipleSchemes { slugs, .. } => {
                assert_eq!(slugs, &vec!["iceland".to_string(), "wasabi".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        let payment = h.store.fetch_payment_transaction(pid).await.unwrap().unwrap();
        assert!(payment.is_pending());
    }

    #[tokio::test]
    async fn unregistered_scheme_is_skipped_unless_debug() {
        let h = harness();
        let mid = merchant_identifier(h.store.as_ref(), "iceland", "MID-1").await.unwrap();
        let pid = identified_payment(&h, &[mid], 500).await;
        let out = h.matching().handle_payment_transaction(pid).await.unwrap();
        assert_eq!(
            out,
            MatchOutcome::NoAgent {
                scheme_slug: "iceland".to_string()
            }
        );

        let h = harness_with(|s| s.debug = true);
        let mid = merchant_identifier(h.store.as_ref(), "iceland", "MID-1").await.unwrap();
        let pid = identified_payment(&h, &[mid], 500).await;
        let err = h.matching().handle_payment_transaction(pid).await.unwrap_err();
        assert!(matches!(err, MatchingError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn no_match_schedules_a_retry() {
        let h = harness().with_field_agent("iceland");
        h.store.set_now(ts(2024, 3, 1, 12, 0));
        let mid = merchant_identifier(h.store.as_ref(), "iceland", "MID-1").await.unwrap();
        let pid = identified_payment(&h, &[mid], 500).await;

        let out = h.matching().handle_payment_transaction(pid).await.unwrap();
        assert_eq!(out, MatchOutcome::NoMatch(RetryScheduled::Scheduled));
        let entry = h
            .store
            .fetch_retry(RetryKind::Matching, pid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.retry_at, Some(ts(2024, 3, 1, 12, 1)));
    }

    #[tokio::test]
    async fn unidentified_leg_waits() {
        let h = harness().with_field_agent("iceland");
        let mid = merchant_identifier(h.store.as_ref(), "iceland", "MID-1").await.unwrap();
        let rec = RecordBuilder::new("visa", "P1", FeedType::Settled)
            .merchant_identifiers(&[mid])
            .build();
        let p = h
            .store
            .insert_payment_transaction("g", &rec)
            .await
            .unwrap()
            .unwrap();

        let out = h.matching().handle_payment_transaction(p.id).await.unwrap();
        assert_eq!(out, MatchOutcome::Unidentified);
        assert!(h.queue.jobs(QueueName::Export).is_empty());
    }

    #[tokio::test]
    async fn late_scheme_leg_requeues_identified_payments() {
        let h = harness().with_field_agent("iceland");
        let mid = merchant_identifier(h.store.as_ref(), "iceland", "MID-1").await.unwrap();
        let pid = identified_payment(&h, &[mid], 500).await;
        let other = merchant_identifier(h.store.as_ref(), "iceland", "MID-2").await.unwrap();

        let rec = RecordBuilder::new("iceland", "S1", FeedType::Merchant)
            .merchant_identifiers(&[mid])
            .build();
        let unrelated = RecordBuilder::new("iceland", "S2", FeedType::Merchant)
            .merchant_identifiers(&[other])
            .build();
        h.store
            .insert_scheme_transactions("late", &[rec, unrelated])
            .await
            .unwrap();

        let queued = h
            .matching()
            .handle_scheme_transactions_in_group("late")
            .await
            .unwrap();
        assert_eq!(queued, vec![pid]);

        let since = h
            .matching()
            .handle_scheme_transactions(ts(2000, 1, 1, 0, 0))
            .await
            .unwrap();
        assert_eq!(since, vec![pid]);
        assert_eq!(
            h.queue.jobs(QueueName::Matching),
            vec![
                Job::MatchPayment {
                    payment_transaction_id: pid
                },
                Job::MatchPayment {
                    payment_transaction_id: pid
                },
            ]
        );
    }
}
