//! End-to-end payment-flow scenarios against a real (in-memory) store:
//! exact payment, split payment, overpayment, duplicate events, buffered
//! transfers and late funds.

use spg_common::AtomicAmount;
use stable_payment_engine::{
    db_types::{IntentStatus, InvoiceStatus, OutboxKind},
    traits::{ConfirmationResult, IngressOutcome},
    InvoiceFlowApi,
    PaymentGatewayDatabase,
};

mod support;

use support::*;

const N_CONFIRM: i64 = 6;

#[tokio::test]
async fn exact_payment_confirms_with_a_single_callback() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xA000000000000000000000000000000000000001"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-s1", 900).await;
    let intent = make_intent(&api, &invoice).await;
    assert_eq!(intent.target_amount, AtomicAmount::from(10_000_000i64));

    let outcome = api
        .process_transfer_event(transfer_event("0x1", 0, &intent.deposit_address, 10_000_000, 100))
        .await
        .unwrap();
    let IngressOutcome::Credited { invoice, intent, newly_paid, surplus } = outcome else {
        panic!("expected a credit");
    };
    assert!(newly_paid);
    assert!(surplus.is_none());
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(intent.status, IntentStatus::Funded);

    // One block short of the threshold: stays Paid.
    let result = api.try_confirm_invoice(invoice.id, 100 + N_CONFIRM - 2, N_CONFIRM).await.unwrap();
    assert!(matches!(result, ConfirmationResult::NotReady { min_confirmations: 5 }));

    let result = api.try_confirm_invoice(invoice.id, 100 + N_CONFIRM - 1, N_CONFIRM).await.unwrap();
    let ConfirmationResult::Confirmed { invoice } = result else {
        panic!("expected confirmation, got {result:?}");
    };
    assert_eq!(invoice.status, InvoiceStatus::Confirmed);

    // Exactly one CONFIRMED status callback was queued.
    let rows = db.fetch_outbox_for_invoice(invoice.id).await.unwrap();
    let confirmed: Vec<_> = rows
        .iter()
        .filter(|r| r.kind == OutboxKind::InvoiceStatusChanged && r.payload.contains("CONFIRMED"))
        .collect();
    assert_eq!(confirmed.len(), 1);
    assert!(confirmed[0].payload.contains("\"paidAmountAtomic\":\"10000000\""));
    assert!(confirmed[0].payload.contains("order-s1"));
}

#[tokio::test]
async fn split_payment_progresses_through_underpaid_to_confirmed() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xA000000000000000000000000000000000000002"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-s2", 900).await;
    let intent = make_intent(&api, &invoice).await;

    let outcome =
        api.process_transfer_event(transfer_event("0x1", 0, &intent.deposit_address, 6_000_000, 100)).await.unwrap();
    let IngressOutcome::Credited { invoice, intent, newly_paid, .. } = outcome else {
        panic!("expected a credit");
    };
    assert!(!newly_paid);
    assert_eq!(invoice.status, InvoiceStatus::Underpaid);
    assert_eq!(intent.status, IntentStatus::PartiallyFunded);

    let outcome =
        api.process_transfer_event(transfer_event("0x2", 0, &intent.deposit_address, 4_000_000, 102)).await.unwrap();
    let IngressOutcome::Credited { invoice, intent, newly_paid, .. } = outcome else {
        panic!("expected a credit");
    };
    assert!(newly_paid);
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(intent.status, IntentStatus::Funded);
    assert_eq!(intent.credited_amount, AtomicAmount::from(10_000_000i64));

    // The first transfer has cleared the threshold, the second has not.
    let result = api.try_confirm_invoice(invoice.id, 106, N_CONFIRM).await.unwrap();
    assert!(matches!(result, ConfirmationResult::NotReady { min_confirmations: 5 }));

    // Both clear at block 107.
    let result = api.try_confirm_invoice(invoice.id, 107, N_CONFIRM).await.unwrap();
    assert!(matches!(result, ConfirmationResult::Confirmed { .. }));

    let rows = db.fetch_outbox_for_invoice(invoice.id).await.unwrap();
    let confirmed = rows
        .iter()
        .filter(|r| r.kind == OutboxKind::InvoiceStatusChanged && r.payload.contains("CONFIRMED"))
        .count();
    assert_eq!(confirmed, 1);
}

#[tokio::test]
async fn overpayment_is_reported_but_does_not_block_confirmation() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xA000000000000000000000000000000000000003"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-s3", 900).await;
    let intent = make_intent(&api, &invoice).await;

    let outcome =
        api.process_transfer_event(transfer_event("0x1", 0, &intent.deposit_address, 15_000_000, 100)).await.unwrap();
    let IngressOutcome::Credited { invoice, intent, surplus, .. } = outcome else {
        panic!("expected a credit");
    };
    assert_eq!(intent.status, IntentStatus::Overfunded);
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(surplus, Some(AtomicAmount::from(5_000_000i64)));

    let rows = db.fetch_outbox_for_invoice(invoice.id).await.unwrap();
    let overpayments: Vec<_> = rows.iter().filter(|r| r.kind == OutboxKind::Overpayment).collect();
    assert_eq!(overpayments.len(), 1);
    assert!(overpayments[0].payload.contains("\"surplusAtomic\":\"5000000\""));
    assert!(overpayments[0].payload.contains("OVERPAID"));

    let result = api.try_confirm_invoice(invoice.id, 105, N_CONFIRM).await.unwrap();
    assert!(matches!(result, ConfirmationResult::Confirmed { .. }));
}

#[tokio::test]
async fn duplicate_events_credit_exactly_once() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xA000000000000000000000000000000000000004"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-s5", 900).await;
    let intent = make_intent(&api, &invoice).await;

    // The same provider event delivered five times.
    let mut credits = 0;
    let mut duplicates = 0;
    for _ in 0..5 {
        let event = transfer_event("0x1", 0, &intent.deposit_address, 10_000_000, 100);
        match api.process_transfer_event(event).await.unwrap() {
            IngressOutcome::Credited { .. } => credits += 1,
            IngressOutcome::Duplicate => duplicates += 1,
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(credits, 1);
    assert_eq!(duplicates, 4);

    let refreshed = db.fetch_intent(&intent.intent_id).await.unwrap().unwrap();
    assert_eq!(refreshed.credited_amount, AtomicAmount::from(10_000_000i64));

    // Exactly the outbox rows of a single credit: one PAID status change and
    // one confirmation poll task.
    let rows = db.fetch_outbox_for_invoice(invoice.id).await.unwrap();
    assert_eq!(rows.iter().filter(|r| r.kind == OutboxKind::InvoiceStatusChanged).count(), 1);
    assert_eq!(rows.iter().filter(|r| r.kind == OutboxKind::PaidAwaitingConfirmation).count(), 1);
}

#[tokio::test]
async fn transfers_before_intent_creation_are_buffered_and_replayed() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xA000000000000000000000000000000000000005"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-buffered", 900).await;

    // The transfer lands before the buyer selects a payment method.
    let address = stable_payment_engine::db_types::Address::from("0xA000000000000000000000000000000000000005");
    let outcome = api.process_transfer_event(transfer_event("0x1", 0, &address, 10_000_000, 100)).await.unwrap();
    assert!(matches!(outcome, IngressOutcome::Unmatched { .. }));

    // Intent creation replays the buffered transfer in the same transaction.
    let (_, created) = api.create_intent(&invoice.invoice_id, usdt_option(), &pricer()).await.unwrap();
    assert_eq!(created.replayed_transfers, 1);
    assert_eq!(created.intent.status, IntentStatus::Funded);
    assert_eq!(created.intent.credited_amount, AtomicAmount::from(10_000_000i64));

    let refreshed = api.fetch_invoice(&invoice.invoice_id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, InvoiceStatus::Paid);
}

#[tokio::test]
async fn zero_amount_transfers_are_recorded_but_never_credited() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(&db, &["0xA000000000000000000000000000000000000006"]).await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-zero", 900).await;
    let intent = make_intent(&api, &invoice).await;

    let outcome =
        api.process_transfer_event(transfer_event("0x1", 0, &intent.deposit_address, 0, 100)).await.unwrap();
    assert!(matches!(outcome, IngressOutcome::ZeroAmount { .. }));

    let refreshed = db.fetch_intent(&intent.intent_id).await.unwrap().unwrap();
    assert_eq!(refreshed.status, IntentStatus::AwaitingFunds);
    assert!(refreshed.credited_amount.is_zero());
}

#[tokio::test]
async fn second_intent_request_for_same_option_returns_the_existing_intent() {
    let db = new_test_db().await;
    let merchant = seed_merchant(&db).await;
    seed_addresses(
        &db,
        &["0xA000000000000000000000000000000000000007", "0xA000000000000000000000000000000000000008"],
    )
    .await;
    let api = InvoiceFlowApi::new(db.clone());

    let invoice = make_invoice(&api, merchant.id, 1000, "order-idem-intent", 900).await;
    let first = make_intent(&api, &invoice).await;
    let (_, second) = api.create_intent(&invoice.invoice_id, usdt_option(), &pricer()).await.unwrap();
    assert!(second.existing);
    assert_eq!(second.intent.id, first.id);
    assert_eq!(second.intent.deposit_address, first.deposit_address);
}
