//! Scenario: SETTLED leg arriving after its AUTH leg was matched or exported
//!
//! # Invariants under test
//!
//! 1. The late SETTLED leg is discarded as a documented duplicate.
//! 2. Discarding it performs zero store writes and zero enqueues, whether the
//!    AUTH leg is MATCHED or already EXPORTED.

mod common;

use std::sync::Arc;

use common::{pipeline, scheme_leg, FlakyDestination, Pipeline};
use mb_pipeline::{ImportDirector, ImportOutcome};
use mb_queue::JobQueue;
use mb_schemas::{FeedType, Job, PaymentTransactionStatus, QueueName};
use mb_testkit::RecordBuilder;

async fn matched_auth_leg(p: &Pipeline) {
    let mid = p.merchant_identifier().await;
    p.dispatcher
        .dispatch(&Job::ImportSchemeTransactions {
            match_group: "scheme-g1".into(),
            records: vec![scheme_leg("S-1", mid, 100)],
        })
        .await
        .unwrap();
    p.dispatcher
        .dispatch(&Job::ImportPaymentTransaction {
            match_group: "pay-g1".into(),
            record: RecordBuilder::new("visa", "A-1", FeedType::Auth)
                .settlement_key("K")
                .merchant_identifiers(&[mid])
                .card("424242", "4242")
                .amount(100)
                .build(),
        })
        .await
        .unwrap();
    p.run_queue(QueueName::Identify).await;
    p.run_queue(QueueName::Matching).await;
}

async fn total_queued(p: &Pipeline) -> u64 {
    let mut total = 0;
    for q in QueueName::ALL {
        total += p.queue.len(q).await.unwrap();
    }
    total
}

async fn assert_late_settled_suppressed(p: &Pipeline) {
    let writes = p.store.writes();
    let queued = total_queued(p).await;

    let outcome = ImportDirector::new(p.ctx.clone())
        .handle_payment_transaction(
            &RecordBuilder::new("visa", "S-9", FeedType::Settled)
                .settlement_key("K")
                .amount(100)
                .auth_code("LATE")
                .build(),
            "pay-g2",
        )
        .await
        .unwrap();

    assert!(matches!(outcome, ImportOutcome::Duplicate { .. }), "{outcome:?}");
    assert_eq!(p.store.writes(), writes, "no store writes");
    assert_eq!(total_queued(p).await, queued, "no enqueues");
    assert_eq!(p.store.payment_transactions().len(), 1);
}

#[tokio::test]
async fn settled_leg_after_match_is_dropped_silently() {
    let p = pipeline(Arc::new(FlakyDestination::default()));
    matched_auth_leg(&p).await;
    assert_eq!(
        p.store.payment_transactions()[0].status,
        PaymentTransactionStatus::Matched
    );

    assert_late_settled_suppressed(&p).await;
}

#[tokio::test]
async fn settled_leg_after_export_is_dropped_silently() {
    let destination = Arc::new(FlakyDestination::default());
    let p = pipeline(destination.clone());
    matched_auth_leg(&p).await;
    p.run_queue(QueueName::Export).await;
    assert_eq!(destination.delivered(), 1);
    assert_eq!(
        p.store.payment_transactions()[0].status,
        PaymentTransactionStatus::Exported
    );

    assert_late_settled_suppressed(&p).await;
}
