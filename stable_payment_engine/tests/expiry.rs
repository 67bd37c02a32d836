//! Expiry sweeps, administrative cancellation and the cooperative worker
//! lease.

use chrono::{Duration, Utc};
use stable_payment_engine::{
    db_types::{IntentStatus, InvoiceStatus, OutboxKind},
    traits::{CancellationResult, IngressOutcome},
    InvoiceFlowApi,
    PaymentGatewayDatabase,
    PaymentGatewayError,
};

mod support;

use support::*;

#[tokio::test]
async fn sweep_expires_due_invoices_and_is_idempotent() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xB000000000000000000000000000000000000001"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    // Already past its expiry instant.
    let expired = make_invoice(&api, merchant.id, 1000, "order-due", -120).await;
    let intent = make_intent(&api, &expired).await;
    // Still current.
    let current = make_invoice(&api, merchant.id, 1000, "order-current", 900).await;

    let result = api.expire_due_invoices(Utc::now(), 50).await.unwrap();
    assert_eq!(result.total_count(), 1);
    assert_eq!(result.with_partial, 0);
    assert_eq!(result.expired[0].invoice_id, expired.invoice_id);

    let refreshed = api.fetch_invoice(&expired.invoice_id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, InvoiceStatus::Expired);
    let intent = db.fetch_intent(&intent.intent_id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Expired);
    let untouched = api.fetch_invoice(&current.invoice_id).await.unwrap().unwrap();
    assert_eq!(untouched.status, InvoiceStatus::Pending);

    let rows = db.fetch_outbox_for_invoice(refreshed.id).await.unwrap();
    assert_eq!(
        rows.iter().filter(|r| r.kind == OutboxKind::InvoiceStatusChanged && r.payload.contains("EXPIRED")).count(),
        1
    );

    // A second sweep finds nothing to do.
    let result = api.expire_due_invoices(Utc::now(), 50).await.unwrap();
    assert_eq!(result.total_count(), 0);
}

#[tokio::test]
async fn partial_payment_at_expiry_emits_expired_with_partial() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xB000000000000000000000000000000000000002"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-partial", -60).await;
    let intent = make_intent(&api, &invoice).await;
    let outcome =
        api.process_transfer_event(transfer_event("0x1", 0, &intent.deposit_address, 4_000_000, 100)).await.unwrap();
    assert!(matches!(outcome, IngressOutcome::Credited { .. }));

    let result = api.expire_due_invoices(Utc::now(), 50).await.unwrap();
    assert_eq!(result.total_count(), 1);
    assert_eq!(result.with_partial, 1);

    let refreshed = api.fetch_invoice(&invoice.invoice_id).await.unwrap().unwrap();
    let rows = db.fetch_outbox_for_invoice(refreshed.id).await.unwrap();
    assert_eq!(rows.iter().filter(|r| r.kind == OutboxKind::ExpiredWithPartial).count(), 1);
}

#[tokio::test]
async fn funds_arriving_after_expiry_yield_late_funds_and_no_state_change() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xB000000000000000000000000000000000000003"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-s4", -60).await;
    let intent = make_intent(&api, &invoice).await;
    api.expire_due_invoices(Utc::now(), 50).await.unwrap();

    // The buyer pays two minutes after the sweep.
    let outcome = api
        .process_transfer_event(transfer_event("0x99", 0, &intent.deposit_address, 10_000_000, 500))
        .await
        .unwrap();
    assert!(matches!(outcome, IngressOutcome::LateFunds { .. }));

    let refreshed = api.fetch_invoice(&invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, InvoiceStatus::Expired);
    let intent = db.fetch_intent(&intent.intent_id).await.unwrap().unwrap();
    assert!(intent.credited_amount.is_zero());

    let rows = db.fetch_outbox_for_invoice(refreshed.id).await.unwrap();
    assert_eq!(rows.iter().filter(|r| r.kind == OutboxKind::LateFunds).count(), 1);
}

#[tokio::test]
async fn cancel_is_a_noop_on_terminal_and_forbidden_on_paid_invoices() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xB000000000000000000000000000000000000004"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-cancel", 900).await;
    let result = api.cancel_invoice(&invoice.invoice_id).await.unwrap();
    let CancellationResult::Cancelled(cancelled) = result else {
        panic!("expected a cancellation");
    };
    assert_eq!(cancelled.status, InvoiceStatus::Cancelled);
    let rows = db.fetch_outbox_for_invoice(cancelled.id).await.unwrap();
    assert_eq!(
        rows.iter()
            .filter(|r| r.kind == OutboxKind::InvoiceStatusChanged && r.payload.contains("CANCELLED"))
            .count(),
        1
    );

    // Cancelling again changes nothing and queues nothing.
    let result = api.cancel_invoice(&invoice.invoice_id).await.unwrap();
    assert!(matches!(result, CancellationResult::AlreadyTerminal(_)));
    let rows = db.fetch_outbox_for_invoice(cancelled.id).await.unwrap();
    assert_eq!(rows.len(), 1);

    // A paid invoice cannot be cancelled.
    let paid = make_invoice(&api, merchant.id, 1000, "order-cancel-paid", 900).await;
    let intent = make_intent(&api, &paid).await;
    api.process_transfer_event(transfer_event("0x5", 0, &intent.deposit_address, 10_000_000, 100)).await.unwrap();
    let err = api.cancel_invoice(&paid.invoice_id).await.unwrap_err();
    assert!(matches!(err, PaymentGatewayError::InvoiceNotCancellable(InvoiceStatus::Paid)));
}

#[tokio::test]
async fn worker_lease_is_exclusive_until_it_lapses() {
    let db = new_test_db().await;
    let now = Utc::now();
    let ttl = Duration::seconds(60);

    assert!(db.acquire_lease("expiry-sweeper", "worker-a", ttl, now).await.unwrap());
    // Renewal by the same holder succeeds.
    assert!(db.acquire_lease("expiry-sweeper", "worker-a", ttl, now + Duration::seconds(30)).await.unwrap());
    // A rival cannot steal a live lease.
    assert!(!db.acquire_lease("expiry-sweeper", "worker-b", ttl, now + Duration::seconds(40)).await.unwrap());
    // Once the lease lapses, the rival takes over.
    assert!(db.acquire_lease("expiry-sweeper", "worker-b", ttl, now + Duration::seconds(200)).await.unwrap());
    // Releasing someone else's lease is a no-op; releasing your own frees it.
    db.release_lease("expiry-sweeper", "worker-a").await.unwrap();
    assert!(!db.acquire_lease("expiry-sweeper", "worker-a", ttl, now + Duration::seconds(210)).await.unwrap());
    db.release_lease("expiry-sweeper", "worker-b").await.unwrap();
    assert!(db.acquire_lease("expiry-sweeper", "worker-a", ttl, now + Duration::seconds(220)).await.unwrap());
}
