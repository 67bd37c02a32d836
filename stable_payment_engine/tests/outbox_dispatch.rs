//! Outbox claim-protocol behaviour: exclusive claims, per-invoice ordering,
//! visibility timeouts, retry/bury bookkeeping and idempotency records.

use chrono::{Duration, Utc};
use stable_payment_engine::{
    db_types::{IdempotencyRecord, IdempotencyScope, OutboxKind, OutboxStatus},
    traits::IngressOutcome,
    InvoiceFlowApi,
    PaymentGatewayDatabase,
    PaymentGatewayError,
};

mod support;

use support::*;

const VISIBILITY: i64 = 60;

#[tokio::test]
async fn claims_are_exclusive_per_invoice_and_ordered_by_id() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xC000000000000000000000000000000000000001"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    // An overpayment produces three rows for one invoice: the PAID status
    // change, the confirmation poll task and the overpayment notice.
    let invoice = make_invoice(&api, merchant.id, 1000, "order-claims", 900).await;
    let intent = make_intent(&api, &invoice).await;
    let outcome =
        api.process_transfer_event(transfer_event("0x1", 0, &intent.deposit_address, 15_000_000, 100)).await.unwrap();
    let IngressOutcome::Credited { invoice, .. } = outcome else {
        panic!("expected a credit");
    };
    let rows = db.fetch_outbox_for_invoice(invoice.id).await.unwrap();
    assert_eq!(rows.len(), 3);

    let now = Utc::now();
    let claimed = db.claim_due_outbox(now, 10, Duration::seconds(VISIBILITY)).await.unwrap();
    // Only the lowest-id row is claimable while its siblings share the invoice.
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, rows[0].id);
    assert_eq!(claimed[0].status, OutboxStatus::InFlight);
    let token = claimed[0].claim_token.clone().unwrap();

    // Nothing else to claim while the first row is in flight.
    let empty = db.claim_due_outbox(now, 10, Duration::seconds(VISIBILITY)).await.unwrap();
    assert!(empty.is_empty());

    // Completing the row releases the invoice for the next one, in id order.
    db.complete_outbox(claimed[0].id, &token).await.unwrap();
    let next = db.claim_due_outbox(now, 10, Duration::seconds(VISIBILITY)).await.unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].id, rows[1].id);
}

#[tokio::test]
async fn stale_claims_are_rejected_and_lapsed_claims_are_reclaimable() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xC000000000000000000000000000000000000002"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-stale", 900).await;
    let intent = make_intent(&api, &invoice).await;
    api.process_transfer_event(transfer_event("0x1", 0, &intent.deposit_address, 10_000_000, 100)).await.unwrap();

    let now = Utc::now();
    let claimed = db.claim_due_outbox(now, 1, Duration::seconds(VISIBILITY)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let row = &claimed[0];
    let token = row.claim_token.clone().unwrap();

    // A wrong token cannot complete, retry or bury the row.
    let err = db.complete_outbox(row.id, "not-the-token").await.unwrap_err();
    assert!(matches!(err, PaymentGatewayError::ClaimMismatch));

    // The worker crashes; after the visibility timeout the row is released
    // and the old token is dead.
    let later = now + Duration::seconds(VISIBILITY + 1);
    let released = db.release_expired_claims(later).await.unwrap();
    assert_eq!(released, 1);
    let err = db.complete_outbox(row.id, &token).await.unwrap_err();
    assert!(matches!(err, PaymentGatewayError::ClaimMismatch));

    let reclaimed = db.claim_due_outbox(later, 1, Duration::seconds(VISIBILITY)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, row.id);
}

#[tokio::test]
async fn retry_and_bury_track_attempts_and_errors() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xC000000000000000000000000000000000000003"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-retry", 900).await;
    let intent = make_intent(&api, &invoice).await;
    api.process_transfer_event(transfer_event("0x1", 0, &intent.deposit_address, 10_000_000, 100)).await.unwrap();

    let now = Utc::now();
    let claimed = db.claim_due_outbox(now, 1, Duration::seconds(VISIBILITY)).await.unwrap();
    let row = &claimed[0];
    let token = row.claim_token.clone().unwrap();
    let delivery_id = row.delivery_id.clone();

    // Transient failure: attempts increments and the row is parked until its
    // next attempt time.
    db.retry_outbox(row.id, &token, now + Duration::seconds(300), "HTTP 503").await.unwrap();
    let parked = db.fetch_outbox_record(row.id).await.unwrap().unwrap();
    assert_eq!(parked.status, OutboxStatus::Pending);
    assert_eq!(parked.attempts, 1);
    assert_eq!(parked.last_error.as_deref(), Some("HTTP 503"));
    // The delivery id is stable across attempts.
    assert_eq!(parked.delivery_id, delivery_id);
    assert!(db.claim_due_outbox(now, 1, Duration::seconds(VISIBILITY)).await.unwrap().is_empty());

    // Due again after the backoff delay.
    let later = now + Duration::seconds(301);
    let reclaimed = db.claim_due_outbox(later, 1, Duration::seconds(VISIBILITY)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    let token = reclaimed[0].claim_token.clone().unwrap();

    // Permanent failure: the row is dead, the invoice state untouched.
    db.bury_outbox(row.id, &token, "HTTP 410").await.unwrap();
    let dead = db.fetch_outbox_record(row.id).await.unwrap().unwrap();
    assert_eq!(dead.status, OutboxStatus::Dead);
    assert_eq!(dead.attempts, 2);
    assert_eq!(dead.delivery_id, delivery_id);
}

#[tokio::test]
async fn reschedule_does_not_consume_an_attempt() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xC000000000000000000000000000000000000004"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-poll", 900).await;
    let intent = make_intent(&api, &invoice).await;
    api.process_transfer_event(transfer_event("0x1", 0, &intent.deposit_address, 10_000_000, 100)).await.unwrap();

    // Work through to the confirmation poll task.
    let now = Utc::now();
    let first = db.claim_due_outbox(now, 1, Duration::seconds(VISIBILITY)).await.unwrap();
    db.complete_outbox(first[0].id, first[0].claim_token.as_deref().unwrap()).await.unwrap();
    let poll = db.claim_due_outbox(now, 1, Duration::seconds(VISIBILITY)).await.unwrap();
    assert_eq!(poll[0].kind, OutboxKind::PaidAwaitingConfirmation);

    db.reschedule_outbox(poll[0].id, poll[0].claim_token.as_deref().unwrap(), now + Duration::seconds(30))
        .await
        .unwrap();
    let parked = db.fetch_outbox_record(poll[0].id).await.unwrap().unwrap();
    assert_eq!(parked.status, OutboxStatus::Pending);
    assert_eq!(parked.attempts, 0);
}

#[tokio::test]
async fn idempotency_records_replay_first_writer_and_expire() {
    let db = new_test_db().await;
    let now = Utc::now();
    let record = IdempotencyRecord {
        scope: IdempotencyScope::CreateInvoice,
        key: "idem-key-1".into(),
        fingerprint: "f".repeat(64),
        response_status: 201,
        response_body: r#"{"invoiceId":"abc"}"#.into(),
        expires_at: now + Duration::hours(24),
        created_at: now,
    };
    assert!(db.store_idempotency_record(record.clone()).await.unwrap());
    // Second writer loses; the stored response wins.
    let mut rival = record.clone();
    rival.response_body = r#"{"invoiceId":"other"}"#.into();
    assert!(!db.store_idempotency_record(rival).await.unwrap());

    let stored = db.fetch_idempotency_record(IdempotencyScope::CreateInvoice, "idem-key-1").await.unwrap().unwrap();
    assert_eq!(stored.response_body, r#"{"invoiceId":"abc"}"#);
    assert_eq!(stored.fingerprint, "f".repeat(64));

    // Scopes are independent key spaces.
    assert!(db
        .fetch_idempotency_record(IdempotencyScope::ProviderWebhook, "idem-key-1")
        .await
        .unwrap()
        .is_none());

    let purged = db.purge_expired_idempotency(now + Duration::hours(25)).await.unwrap();
    assert_eq!(purged, 1);
    assert!(db.fetch_idempotency_record(IdempotencyScope::CreateInvoice, "idem-key-1").await.unwrap().is_none());
}
