//! Import director.
//!
//! Scheme feeds are ground truth: every new row in a batch is persisted in one
//! unit and the group is queued for matching. Payment feeds need settlement
//! reconciliation, because the same purchase arrives once as an AUTH leg and
//! again as a SETTLED leg, in either order:
//!
//! | incoming | already stored for the settlement key | action                          |
//! |----------|---------------------------------------|---------------------------------|
//! | AUTH     | SETTLED leg                           | drop AUTH, identify SETTLED leg |
//! | AUTH     | other AUTH leg                        | discard as duplicate            |
//! | AUTH     | nothing                               | persist PENDING, identify       |
//! | SETTLED  | PENDING AUTH leg                      | back-fill AUTH leg, re-match    |
//! | SETTLED  | matched / exported AUTH leg           | discard as late duplicate       |
//! | SETTLED  | nothing                               | persist PENDING, identify       |
//!
//! Exactly one downstream job is queued per persisted or updated row. Nothing
//! is queued for a discarded duplicate. A settled leg folded onto an AUTH leg
//! keeps its own ledger row, so its redelivery is caught by ledger key. When
//! the downstream enqueue fails after the rows are committed, a retry entry
//! takes its place.

use std::collections::HashSet;

use tracing::{info, warn};

use mb_db::{LedgerKey, SettlementOverride};
use mb_schemas::{FeedType, Job, PaymentTransaction, RetryKind, TransactionRecord};

use crate::context::PipelineContext;
use crate::error::ImportError;
use crate::retry::defer_unqueued;

/// What happened to one payment-feed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// New payment leg stored and queued for identification.
    Persisted { payment_transaction_id: i64 },
    /// Settled leg folded onto the existing AUTH leg, which is queued for
    /// matching again.
    Overridden { payment_transaction_id: i64 },
    /// AUTH leg dropped in favour of the stored settled leg, which is queued
    /// for identification.
    Superseded { payment_transaction_id: i64 },
    /// Documented duplicate. Nothing written, nothing queued.
    Duplicate { reason: &'static str },
}

/// Counts for one scheme-feed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemeImportSummary {
    pub inserted: Vec<i64>,
    pub duplicates: usize,
}

#[derive(Clone)]
pub struct ImportDirector {
    ctx: PipelineContext,
}

impl ImportDirector {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Persist a scheme-feed batch and queue the group for matching.
    ///
    /// Rows whose ledger key is already stored (or repeated within the batch)
    /// are skipped; the remainder is written in one unit.
    pub async fn handle_scheme_transactions(
        &self,
        records: &[TransactionRecord],
        match_group: &str,
    ) -> Result<SchemeImportSummary, ImportError> {
        if let Some(bad) = records.iter().find(|r| r.feed_type != FeedType::Merchant) {
            return Err(ImportError::UnsupportedFeed {
                feed_type: bad.feed_type,
            });
        }

        let keys: Vec<LedgerKey> = records.iter().map(LedgerKey::of).collect();
        let existing = self.ctx.store.existing_ledger_keys(&keys).await?;

        let mut seen: HashSet<&LedgerKey> = HashSet::new();
        let mut fresh: Vec<TransactionRecord> = Vec::with_capacity(records.len());
        for (record, key) in records.iter().zip(keys.iter()) {
            if existing.contains(key) || !seen.insert(key) {
                info!(
                    transaction_id = %record.transaction_id,
                    provider_slug = %record.provider_slug,
                    match_group,
                    reason = "ledger key already imported",
                    "scheme transaction discarded"
                );
                continue;
            }
            fresh.push(record.clone());
        }

        let duplicates = records.len() - fresh.len();
        if fresh.is_empty() {
            return Ok(SchemeImportSummary {
                inserted: Vec::new(),
                duplicates,
            });
        }

        let inserted = self
            .ctx
            .store
            .insert_scheme_transactions(match_group, &fresh)
            .await?;
        let duplicates = records.len() - inserted.len();

        if !inserted.is_empty() {
            self.ctx
                .queues
                .enqueue(Job::MatchSchemeGroup {
                    match_group: match_group.to_string(),
                })
                .await?;
        }
        info!(
            match_group,
            inserted = inserted.len(),
            duplicates,
            "scheme transactions imported"
        );
        Ok(SchemeImportSummary {
            inserted,
            duplicates,
        })
    }

    /// Route a payment-feed record by feed type.
    pub async fn handle_payment_transaction(
        &self,
        record: &TransactionRecord,
        match_group: &str,
    ) -> Result<ImportOutcome, ImportError> {
        match record.feed_type {
            FeedType::Auth => self.handle_auth_payment_transaction(record, match_group).await,
            FeedType::Settled => {
                self.handle_settled_payment_transaction(record, match_group)
                    .await
            }
            FeedType::Refund => {
                self.handle_refund_payment_transaction(record, match_group)
                    .await
            }
            FeedType::Merchant => Err(ImportError::UnsupportedFeed {
                feed_type: record.feed_type,
            }),
        }
    }

    pub async fn handle_auth_payment_transaction(
        &self,
        record: &TransactionRecord,
        match_group: &str,
    ) -> Result<ImportOutcome, ImportError> {
        let Some(settlement_key) = record.settlement_key() else {
            warn!(
                transaction_id = %record.transaction_id,
                provider_slug = %record.provider_slug,
                "auth transaction rejected: no settlement key"
            );
            return Err(ImportError::InvalidAuthTransaction {
                transaction_id: record.transaction_id.clone(),
            });
        };

        if let Some(outcome) = self.ledger_duplicate(record).await? {
            return Ok(outcome);
        }

        let store = &self.ctx.store;
        if let Some(settled) = store
            .find_payment_by_settlement_key(settlement_key, FeedType::Settled)
            .await?
        {
            info!(
                transaction_id = %record.transaction_id,
                settlement_key,
                settled_payment_transaction_id = settled.id,
                "auth transaction dropped: settled leg already imported"
            );
            self.ctx
                .queues
                .enqueue(Job::IdentifyPayment {
                    payment_transaction_id: settled.id,
                })
                .await?;
            return Ok(ImportOutcome::Superseded {
                payment_transaction_id: settled.id,
            });
        }

        if let Some(auth) = store
            .find_payment_by_settlement_key(settlement_key, FeedType::Auth)
            .await?
        {
            return Ok(discard(
                record,
                settlement_key,
                auth.id,
                "auth leg already imported for settlement key",
            ));
        }

        self.persist_and_identify(record, match_group).await
    }

    pub async fn handle_settled_payment_transaction(
        &self,
        record: &TransactionRecord,
        match_group: &str,
    ) -> Result<ImportOutcome, ImportError> {
        if let Some(outcome) = self.ledger_duplicate(record).await? {
            return Ok(outcome);
        }

        let Some(settlement_key) = record.settlement_key() else {
            return self.persist_and_identify(record, match_group).await;
        };

        let store = &self.ctx.store;
        if let Some(auth) = store
            .find_payment_by_settlement_key(settlement_key, FeedType::Auth)
            .await?
        {
            if !auth.is_pending() {
                return Ok(discard(
                    record,
                    settlement_key,
                    auth.id,
                    "auth leg already matched",
                ));
            }
            return self
                .override_auth(&auth, record, settlement_key, match_group)
                .await;
        }

        if let Some(settled) = store
            .find_payment_by_settlement_key(settlement_key, FeedType::Settled)
            .await?
        {
            return Ok(discard(
                record,
                settlement_key,
                settled.id,
                "settled leg already imported for settlement key",
            ));
        }

        self.persist_and_identify(record, match_group).await
    }

    /// Refunds are never reconciled against an AUTH leg.
    pub async fn handle_refund_payment_transaction(
        &self,
        record: &TransactionRecord,
        match_group: &str,
    ) -> Result<ImportOutcome, ImportError> {
        if let Some(outcome) = self.ledger_duplicate(record).await? {
            return Ok(outcome);
        }
        self.persist_and_identify(record, match_group).await
    }

    async fn override_auth(
        &self,
        auth: &PaymentTransaction,
        settled: &TransactionRecord,
        settlement_key: &str,
        match_group: &str,
    ) -> Result<ImportOutcome, ImportError> {
        let updated = match self
            .ctx
            .store
            .apply_settlement_override(auth.id, match_group, settled)
            .await?
        {
            SettlementOverride::Applied(updated) => updated,
            SettlementOverride::AlreadyApplied => {
                return Ok(discard(
                    settled,
                    settlement_key,
                    auth.id,
                    "settled leg already applied",
                ));
            }
            // Matched between our read and the conditional update.
            SettlementOverride::NotPending => {
                return Ok(discard(
                    settled,
                    settlement_key,
                    auth.id,
                    "auth leg already matched",
                ));
            }
        };

        let job = Job::MatchPayment {
            payment_transaction_id: updated.id,
        };
        if let Err(e) = self.ctx.queues.enqueue(job).await {
            defer_unqueued(&self.ctx, RetryKind::Matching, updated.id, &e).await?;
            return Err(e.into());
        }
        info!(
            payment_transaction_id = updated.id,
            settlement_key,
            old_transaction_id = %auth.transaction_id,
            transaction_id = %updated.transaction_id,
            spend_amount = updated.spend_amount,
            "settled leg applied to auth transaction"
        );
        Ok(ImportOutcome::Overridden {
            payment_transaction_id: updated.id,
        })
    }

    async fn persist_and_identify(
        &self,
        record: &TransactionRecord,
        match_group: &str,
    ) -> Result<ImportOutcome, ImportError> {
        let Some(payment) = self
            .ctx
            .store
            .insert_payment_transaction(match_group, record)
            .await?
        else {
            info!(
                transaction_id = %record.transaction_id,
                provider_slug = %record.provider_slug,
                feed_type = %record.feed_type,
                reason = "ledger key already imported",
                "payment transaction discarded"
            );
            return Ok(ImportOutcome::Duplicate {
                reason: "ledger key already imported",
            });
        };

        let job = Job::IdentifyPayment {
            payment_transaction_id: payment.id,
        };
        if let Err(e) = self.ctx.queues.enqueue(job).await {
            defer_unqueued(&self.ctx, RetryKind::Identify, payment.id, &e).await?;
            return Err(e.into());
        }
        info!(
            payment_transaction_id = payment.id,
            transaction_id = %payment.transaction_id,
            feed_type = %payment.feed_type,
            match_group,
            "payment transaction imported"
        );
        Ok(ImportOutcome::Persisted {
            payment_transaction_id: payment.id,
        })
    }

    async fn ledger_duplicate(
        &self,
        record: &TransactionRecord,
    ) -> Result<Option<ImportOutcome>, ImportError> {
        let key = LedgerKey::of(record);
        let existing = self
            .ctx
            .store
            .existing_ledger_keys(std::slice::from_ref(&key))
            .await?;
        if existing.contains(&key) {
            info!(
                transaction_id = %record.transaction_id,
                provider_slug = %record.provider_slug,
                feed_type = %record.feed_type,
                reason = "ledger key already imported",
                "payment transaction discarded"
            );
            return Ok(Some(ImportOutcome::Duplicate {
                reason: "ledger key already imported",
            }));
        }
        Ok(None)
    }
}

fn discard(
    record: &TransactionRecord,
    settlement_key: &str,
    existing_id: i64,
    reason: &'static str,
) -> ImportOutcome {
    info!(
        transaction_id = %record.transaction_id,
        feed_type = %record.feed_type,
        settlement_key,
        existing_payment_transaction_id = existing_id,
        reason,
        "payment transaction discarded"
    );
    ImportOutcome::Duplicate { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, harness_with};
    use mb_db::RetryStore;
    use mb_schemas::QueueName;
    use mb_testkit::{auth_record, refund_record, scheme_record, settled_record, RecordBuilder};

    #[tokio::test]
    async fn auth_without_settlement_key_is_rejected() {
        let h = harness();
        let record = RecordBuilder::new("visa", "T1", FeedType::Auth).build();

        let err = h
            .import()
            .handle_payment_transaction(&record, "g1")
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidAuthTransaction { .. }));
        assert!(h.store.payment_transactions().is_empty());
        assert!(h.queue.jobs(QueueName::Identify).is_empty());
    }

    #[tokio::test]
    async fn blank_settlement_key_counts_as_missing() {
        let h = harness();
        let record = RecordBuilder::new("visa", "T1", FeedType::Auth)
            .settlement_key("   ")
            .build();
        let err = h
            .import()
            .handle_auth_payment_transaction(&record, "g1")
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidAuthTransaction { .. }));
    }

    #[tokio::test]
    async fn fresh_auth_is_persisted_and_identified() {
        let h = harness();
        let out = h
            .import()
            .handle_payment_transaction(&auth_record("A1", "K", 100), "g1")
            .await
            .unwrap();

        let rows = h.store.payment_transactions();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            out,
            ImportOutcome::Persisted {
                payment_transaction_id: rows[0].id
            }
        );
        assert_eq!(
            h.queue.jobs(QueueName::Identify),
            vec![Job::IdentifyPayment {
                payment_transaction_id: rows[0].id
            }]
        );
    }

    #[tokio::test]
    async fn auth_after_settled_is_dropped() {
        let h = harness();
        let import = h.import();
        import
            .handle_payment_transaction(&settled_record("S1", "K", 120), "g1")
            .await
            .unwrap();
        let settled_id = h.store.payment_transactions()[0].id;
        h.queue.drain(QueueName::Identify);

        let out = import
            .handle_payment_transaction(&auth_record("A1", "K", 100), "g1")
            .await
            .unwrap();
        assert_eq!(
            out,
            ImportOutcome::Superseded {
                payment_transaction_id: settled_id
            }
        );
        assert_eq!(h.store.payment_transactions().len(), 1);
        assert_eq!(
            h.queue.jobs(QueueName::Identify),
            vec![Job::IdentifyPayment {
                payment_transaction_id: settled_id
            }]
        );
    }

    #[tokio::test]
    async fn second_auth_for_same_key_is_discarded() {
        let h = harness();
        let import = h.import();
        import
            .handle_payment_transaction(&auth_record("A1", "K", 100), "g1")
            .await
            .unwrap();
        h.queue.drain(QueueName::Identify);
        let writes = h.store.writes();

        let out = import
            .handle_payment_transaction(&auth_record("A2", "K", 100), "g1")
            .await
            .unwrap();
        assert!(matches!(out, ImportOutcome::Duplicate { .. }));
        assert_eq!(h.store.writes(), writes);
        assert!(h.queue.jobs(QueueName::Identify).is_empty());
    }

    #[tokio::test]
    async fn redelivered_settled_leg_is_not_applied_twice() {
        let h = harness();
        let import = h.import();
        import
            .handle_payment_transaction(&auth_record("A1", "K", 100), "g1")
            .await
            .unwrap();
        let settled = settled_record("S1", "K", 150);
        let first = import.handle_payment_transaction(&settled, "g1").await.unwrap();
        assert!(matches!(first, ImportOutcome::Overridden { .. }));
        h.queue.drain(QueueName::Matching);

        let second = import.handle_payment_transaction(&settled, "g1").await.unwrap();
        assert!(matches!(second, ImportOutcome::Duplicate { .. }));
        assert!(h.queue.jobs(QueueName::Matching).is_empty());
    }

    #[tokio::test]
    async fn settled_leg_reusing_auth_id_and_amount_is_applied() {
        let h = harness();
        let import = h.import();
        import
            .handle_payment_transaction(&auth_record("T-1", "K", 100), "g1")
            .await
            .unwrap();
        h.queue.drain(QueueName::Identify);

        let settled = RecordBuilder::new("visa", "T-1", FeedType::Settled)
            .settlement_key("K")
            .amount(100)
            .auth_code("AB12")
            .build();
        let out = import.handle_payment_transaction(&settled, "g1").await.unwrap();
        let auth = &h.store.payment_transactions()[0];
        assert_eq!(
            out,
            ImportOutcome::Overridden {
                payment_transaction_id: auth.id
            }
        );
        assert_eq!(auth.auth_code, "AB12");
        assert_eq!(
            h.queue.drain(QueueName::Matching),
            vec![Job::MatchPayment {
                payment_transaction_id: auth.id
            }]
        );

        let writes = h.store.writes();
        let again = import.handle_payment_transaction(&settled, "g1").await.unwrap();
        assert!(matches!(again, ImportOutcome::Duplicate { .. }));
        assert_eq!(h.store.writes(), writes);
        assert!(h.queue.jobs(QueueName::Matching).is_empty());
    }

    #[tokio::test]
    async fn unqueued_identify_job_leaves_a_retry_entry() {
        let h = harness_with(|s| s.queues.enqueue_retry.max_attempts = 0);
        h.queue.fail_next_enqueues(1);

        let err = h
            .import()
            .handle_payment_transaction(&auth_record("A1", "K", 100), "g1")
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Queue(_)));

        let payment = &h.store.payment_transactions()[0];
        let entry = h
            .store
            .fetch_retry(RetryKind::Identify, payment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.retry_at, Some(h.store.now()));
        assert!(h.queue.jobs(QueueName::Identify).is_empty());

        h.sweeper().sweep_identify().await.unwrap();
        assert_eq!(
            h.queue.jobs(QueueName::Identify),
            vec![Job::IdentifyPayment {
                payment_transaction_id: payment.id
            }]
        );
    }

    #[tokio::test]
    async fn unqueued_match_job_after_override_leaves_a_retry_entry() {
        let h = harness_with(|s| s.queues.enqueue_retry.max_attempts = 0);
        let import = h.import();
        import
            .handle_payment_transaction(&auth_record("A1", "K", 100), "g1")
            .await
            .unwrap();
        h.queue.fail_next_enqueues(1);

        let err = import
            .handle_payment_transaction(&settled_record("S1", "K", 150), "g1")
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Queue(_)));

        let auth = &h.store.payment_transactions()[0];
        assert_eq!(auth.spend_amount, 150);
        assert!(h
            .store
            .fetch_retry(RetryKind::Matching, auth.id)
            .await
            .unwrap()
            .is_some());
        assert!(h.queue.jobs(QueueName::Matching).is_empty());
    }

    #[tokio::test]
    async fn settled_without_auth_is_persisted() {
        let h = harness();
        let out = h
            .import()
            .handle_payment_transaction(&settled_record("S1", "K", 120), "g1")
            .await
            .unwrap();
        assert!(matches!(out, ImportOutcome::Persisted { .. }));
        assert_eq!(h.queue.jobs(QueueName::Identify).len(), 1);
        assert!(h.queue.jobs(QueueName::Matching).is_empty());
    }

    #[tokio::test]
    async fn refund_is_persisted_like_a_fresh_leg() {
        let h = harness();
        let out = h
            .import()
            .handle_payment_transaction(&refund_record("R1", -100), "g1")
            .await
            .unwrap();
        assert!(matches!(out, ImportOutcome::Persisted { .. }));
        assert_eq!(h.queue.jobs(QueueName::Identify).len(), 1);
    }

    #[tokio::test]
    async fn merchant_feed_is_not_a_payment_feed() {
        let h = harness();
        let err = h
            .import()
            .handle_payment_transaction(&scheme_record("M1", &[1]), "g1")
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedFeed { .. }));
    }

    #[tokio::test]
    async fn scheme_batch_skips_known_and_repeated_keys() {
        let h = harness();
        let import = h.import();
        let first = import
            .handle_scheme_transactions(&[scheme_record("M1", &[1])], "g1")
            .await
            .unwrap();
        assert_eq!(first.inserted.len(), 1);
        assert_eq!(
            h.queue.drain(QueueName::Matching),
            vec![Job::MatchSchemeGroup {
                match_group: "g1".to_string()
            }]
        );

        let batch = [
            scheme_record("M1", &[1]),
            scheme_record("M2", &[1]),
            scheme_record("M2", &[1]),
        ];
        let second = import.handle_scheme_transactions(&batch, "g2").await.unwrap();
        assert_eq!(second.inserted.len(), 1);
        assert_eq!(second.duplicates, 2);
        assert_eq!(h.store.scheme_transactions().len(), 2);
        assert_eq!(h.queue.jobs(QueueName::Matching).len(), 1);
    }

    #[tokio::test]
    async fn all_duplicate_scheme_batch_queues_nothing() {
        let h = harness();
        let import = h.import();
        import
            .handle_scheme_transactions(&[scheme_record("M1", &[1])], "g1")
            .await
            .unwrap();
        h.queue.drain(QueueName::Matching);

        let again = import
            .handle_scheme_transactions(&[scheme_record("M1", &[1])], "g1")
            .await
            .unwrap();
        assert!(again.inserted.is_empty());
        assert!(h.queue.jobs(QueueName::Matching).is_empty());
    }
}
