//! Scenario: AUTH leg followed by its SETTLED leg
//!
//! # Invariants under test
//!
//! 1. The SETTLED leg is folded onto the stored AUTH row: settled amount
//!    wins, an auth code the AUTH leg lacked is filled in.
//! 2. No second payment row is created for the settlement key.
//! 3. Exactly one matching job is queued, and it references the original
//!    AUTH row's id.
//! 4. Card and auth-code fields the AUTH row already carries are kept; only
//!    the amount and transaction id follow the SETTLED leg.
//! 5. A SETTLED leg reusing the AUTH leg's transaction id and amount is still
//!    applied once, and its redelivery is discarded.

mod common;

use std::sync::Arc;

use common::{pipeline, FlakyDestination};
use mb_pipeline::{ImportDirector, ImportOutcome};
use mb_schemas::{FeedType, Job, QueueName};
use mb_testkit::RecordBuilder;

fn leg(feed: FeedType, transaction_id: &str, key: &str, amount: i64, auth_code: &str) -> Job {
    Job::ImportPaymentTransaction {
        match_group: "pay-g1".into(),
        record: RecordBuilder::new("visa", transaction_id, feed)
            .settlement_key(key)
            .amount(amount)
            .auth_code(auth_code)
            .build(),
    }
}

async fn auth_then_settled(
    key: &str,
    auth_amount: i64,
    settled_amount: i64,
    auth_code: &str,
) -> common::Pipeline {
    let p = pipeline(Arc::new(FlakyDestination::default()));
    p.dispatcher
        .dispatch(&leg(FeedType::Auth, "A-1", key, auth_amount, ""))
        .await
        .unwrap();
    p.dispatcher
        .dispatch(&leg(FeedType::Settled, "S-1", key, settled_amount, auth_code))
        .await
        .unwrap();
    p
}

#[tokio::test]
async fn settled_leg_overrides_auth_row_in_place() {
    let p = auth_then_settled("K", 100, 150, "AB12").await;

    let rows = p.store.payment_transactions();
    assert_eq!(rows.len(), 1, "no second row for key K");
    let row = &rows[0];
    assert_eq!(row.spend_amount, 150);
    assert_eq!(row.auth_code, "AB12");
    assert_eq!(row.settlement_key.as_deref(), Some("K"));

    assert_eq!(
        p.queue.jobs(QueueName::Matching),
        vec![Job::MatchPayment {
            payment_transaction_id: row.id
        }]
    );
}

#[tokio::test]
async fn auth_then_settled_for_key_x_yields_one_row_and_one_match_job() {
    let p = auth_then_settled("X", 100, 120, "Z9").await;

    let rows = p.store.payment_transactions();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].spend_amount, 120);
    assert_eq!(rows[0].auth_code, "Z9");

    let matching = p.queue.jobs(QueueName::Matching);
    assert_eq!(matching.len(), 1, "one matching job, not two");
    assert_eq!(
        matching[0],
        Job::MatchPayment {
            payment_transaction_id: rows[0].id
        }
    );
}

#[tokio::test]
async fn repeated_settled_leg_is_discarded() {
    let p = auth_then_settled("K", 100, 150, "AB12").await;
    let writes = p.store.writes();

    let again = ImportDirector::new(p.ctx.clone())
        .handle_payment_transaction(
            &RecordBuilder::new("visa", "S-1", FeedType::Settled)
                .settlement_key("K")
                .amount(150)
                .auth_code("AB12")
                .build(),
            "pay-g2",
        )
        .await
        .unwrap();
    assert!(matches!(again, ImportOutcome::Duplicate { .. }), "{again:?}");
    assert_eq!(p.store.writes(), writes);
    assert_eq!(p.queue.jobs(QueueName::Matching).len(), 1);
}

#[tokio::test]
async fn auth_row_card_fields_win_over_settled_leg() {
    let p = pipeline(Arc::new(FlakyDestination::default()));
    let auth = RecordBuilder::new("visa", "A-1", FeedType::Auth)
        .settlement_key("K")
        .amount(100)
        .card("111111", "1111")
        .auth_code("OLD1")
        .build();
    let settled = RecordBuilder::new("visa", "S-1", FeedType::Settled)
        .settlement_key("K")
        .amount(150)
        .card("222222", "2222")
        .auth_code("NEW2")
        .build();
    let import = ImportDirector::new(p.ctx.clone());
    import.handle_payment_transaction(&auth, "pay-g1").await.unwrap();
    let out = import.handle_payment_transaction(&settled, "pay-g1").await.unwrap();
    assert!(matches!(out, ImportOutcome::Overridden { .. }), "{out:?}");

    let rows = p.store.payment_transactions();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.spend_amount, 150);
    assert_eq!(row.transaction_id, "S-1");
    assert_eq!(row.first_six.as_deref(), Some("111111"));
    assert_eq!(row.last_four.as_deref(), Some("1111"));
    assert_eq!(row.auth_code, "OLD1");
}

#[tokio::test]
async fn settled_leg_sharing_auth_id_and_amount_is_applied_once() {
    let p = pipeline(Arc::new(FlakyDestination::default()));
    p.dispatcher
        .dispatch(&leg(FeedType::Auth, "T-1", "K", 100, ""))
        .await
        .unwrap();
    let settled = leg(FeedType::Settled, "T-1", "K", 100, "AB12");
    p.dispatcher.dispatch(&settled).await.unwrap();

    let rows = p.store.payment_transactions();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].auth_code, "AB12");
    assert_eq!(
        p.queue.jobs(QueueName::Matching),
        vec![Job::MatchPayment {
            payment_transaction_id: rows[0].id
        }]
    );

    let writes = p.store.writes();
    p.dispatcher.dispatch(&settled).await.unwrap();
    assert_eq!(p.store.writes(), writes);
    assert_eq!(p.queue.jobs(QueueName::Matching).len(), 1);
}
