use actix_web::test;
use chrono::Utc;
use serde_json::Value;
use stable_payment_engine::helpers::{callback_signature, SIGNATURE_HEADER, SIGNATURE_TIMESTAMP_HEADER};

use super::helpers::*;
use crate::routes::API_KEY_HEADER;

fn event_body(tx_hash: &str, amount: &str) -> String {
    serde_json::json!({
        "chain": TEST_CHAIN,
        "txHash": tx_hash,
        "logIndex": 0,
        "token": "USDT",
        "to": TEST_ADDRESS,
        "amount": amount,
        "blockNumber": 100,
        "providerEventId": format!("evt-{tx_hash}")
    })
    .to_string()
}

fn signed_webhook(body: &str) -> test::TestRequest {
    let timestamp = Utc::now().timestamp();
    let signature = callback_signature::sign(TEST_WEBHOOK_SECRET, timestamp, body.as_bytes());
    test::TestRequest::post()
        .uri("/webhooks/provider")
        .insert_header(("Content-Type", "application/json"))
        .insert_header((SIGNATURE_HEADER, signature))
        .insert_header((SIGNATURE_TIMESTAMP_HEADER, timestamp.to_string()))
        .set_payload(body.to_string())
}

async fn create_invoice_with_intent(
    app: &impl actix_web::dev::Service<
        actix_http::Request,
        Response = actix_web::dev::ServiceResponse,
        Error = actix_web::Error,
    >,
) -> String {
    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("Idempotency-Key", "wh-key-1"))
        .set_json(invoice_body("order-webhook"))
        .to_request();
    let created: Value = test::read_body_json(test::call_service(app, req).await).await;
    let invoice_id = created["invoiceId"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/api/invoices/{invoice_id}/intents"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .set_json(serde_json::json!({ "token": "USDT", "chain": TEST_CHAIN }))
        .to_request();
    let resp = test::call_service(app, req).await;
    assert_eq!(resp.status().as_u16(), 201);
    invoice_id
}

#[actix_web::test]
async fn unsigned_or_tampered_webhooks_are_rejected() {
    let (db, config, _merchant) = setup().await;
    let app = test_app!(db, config);
    let body = event_body("0x1", "10000000");

    // Missing signature headers.
    let req = test::TestRequest::post()
        .uri("/webhooks/provider")
        .insert_header(("Content-Type", "application/json"))
        .set_payload(body.clone())
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 403);

    // Signed, then tampered with.
    let timestamp = Utc::now().timestamp();
    let signature = callback_signature::sign(TEST_WEBHOOK_SECRET, timestamp, body.as_bytes());
    let tampered = event_body("0x1", "99000000");
    let req = test::TestRequest::post()
        .uri("/webhooks/provider")
        .insert_header(("Content-Type", "application/json"))
        .insert_header((SIGNATURE_HEADER, signature))
        .insert_header((SIGNATURE_TIMESTAMP_HEADER, timestamp.to_string()))
        .set_payload(tampered)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 403);
}

#[actix_web::test]
async fn signed_events_credit_the_intent_and_replays_are_no_ops() {
    let (db, config, _merchant) = setup().await;
    let app = test_app!(db, config);
    let invoice_id = create_invoice_with_intent(&app).await;

    let body = event_body("0x1", "10000000");
    let resp = test::call_service(&app, signed_webhook(&body).to_request()).await;
    assert_eq!(resp.status().as_u16(), 200);

    let req = test::TestRequest::get()
        .uri(&format!("/api/invoices/{invoice_id}/status"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let status: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(status["status"], "PAID");

    // The provider redelivers the same event; nothing changes.
    for _ in 0..3 {
        let resp = test::call_service(&app, signed_webhook(&body).to_request()).await;
        assert_eq!(resp.status().as_u16(), 200);
    }
    let req = test::TestRequest::get()
        .uri(&format!("/api/invoices/{invoice_id}"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let view: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(view["status"], "PAID");
    assert_eq!(view["intents"][0]["creditedAmount"], "10000000");
}

#[actix_web::test]
async fn underpayment_then_topup_progresses_to_paid() {
    let (db, config, _merchant) = setup().await;
    let app = test_app!(db, config);
    let invoice_id = create_invoice_with_intent(&app).await;

    let resp = test::call_service(&app, signed_webhook(&event_body("0x1", "6000000")).to_request()).await;
    assert_eq!(resp.status().as_u16(), 200);
    let req = test::TestRequest::get()
        .uri(&format!("/api/invoices/{invoice_id}/status"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let status: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(status["status"], "UNDERPAID");

    let resp = test::call_service(&app, signed_webhook(&event_body("0x2", "4000000")).to_request()).await;
    assert_eq!(resp.status().as_u16(), 200);
    let req = test::TestRequest::get()
        .uri(&format!("/api/invoices/{invoice_id}/status"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let status: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(status["status"], "PAID");
}
