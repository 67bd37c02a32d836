use actix_web::test;
use serde_json::Value;

use super::helpers::*;
use crate::routes::API_KEY_HEADER;

#[actix_web::test]
async fn create_invoice_requires_an_api_key_and_an_idempotency_key() {
    let (db, config, _merchant) = setup().await;
    let app = test_app!(db, config);

    // No API key.
    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header(("Idempotency-Key", "k1"))
        .set_json(invoice_body("order-1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 401);

    // No idempotency key.
    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .set_json(invoice_body("order-1"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);
}

#[actix_web::test]
async fn idempotent_create_replays_the_original_response_byte_for_byte() {
    let (db, config, _merchant) = setup().await;
    let app = test_app!(db, config);

    let body = invoice_body("order-idem");
    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("Idempotency-Key", "key-1"))
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 201);
    let first = test::read_body(resp).await;

    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("Idempotency-Key", "key-1"))
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 201);
    let second = test::read_body(resp).await;

    assert_eq!(first, second);
    let parsed: Value = serde_json::from_slice(&first).unwrap();
    assert_eq!(parsed["status"], "PENDING");
    assert!(parsed["payUrl"].as_str().unwrap().contains(parsed["invoiceId"].as_str().unwrap()));
}

#[actix_web::test]
async fn reusing_an_idempotency_key_with_a_different_body_is_a_conflict() {
    let (db, config, _merchant) = setup().await;
    let app = test_app!(db, config);

    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("Idempotency-Key", "key-2"))
        .set_json(invoice_body("order-a"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 201);

    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("Idempotency-Key", "key-2"))
        .set_json(invoice_body("order-b"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 409);
}

#[actix_web::test]
async fn duplicate_merchant_order_ids_are_rejected() {
    let (db, config, _merchant) = setup().await;
    let app = test_app!(db, config);

    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("Idempotency-Key", "key-3"))
        .set_json(invoice_body("order-dup"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 201);

    // A different idempotency key, but the merchant order id already exists.
    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("Idempotency-Key", "key-4"))
        .set_json(invoice_body("order-dup"))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 409);
}

#[actix_web::test]
async fn intent_creation_quotes_the_atomic_amount_and_is_idempotent_per_option() {
    let (db, config, _merchant) = setup().await;
    let app = test_app!(db, config);

    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("Idempotency-Key", "key-5"))
        .set_json(invoice_body("order-intent"))
        .to_request();
    let created: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let invoice_id = created["invoiceId"].as_str().unwrap();

    let req = test::TestRequest::post()
        .uri(&format!("/api/invoices/{invoice_id}/intents"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .set_json(serde_json::json!({ "token": "USDT", "chain": TEST_CHAIN }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 201);
    let intent: Value = test::read_body_json(resp).await;
    // $10.00 at 6 decimals.
    assert_eq!(intent["atomicAmount"], "10000000");
    assert_eq!(intent["depositAddress"], TEST_ADDRESS);

    // Asking again returns the same intent, not a second one.
    let req = test::TestRequest::post()
        .uri(&format!("/api/invoices/{invoice_id}/intents"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .set_json(serde_json::json!({ "token": "USDT", "chain": TEST_CHAIN }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let again: Value = test::read_body_json(resp).await;
    assert_eq!(again["intentId"], intent["intentId"]);

    // An option outside the invoice's allowed set is rejected.
    let req = test::TestRequest::post()
        .uri(&format!("/api/invoices/{invoice_id}/intents"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .set_json(serde_json::json!({ "token": "USDC", "chain": TEST_CHAIN }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 400);
}

#[actix_web::test]
async fn status_poll_and_cancel_round_trip() {
    let (db, config, _merchant) = setup().await;
    let app = test_app!(db, config);

    let req = test::TestRequest::post()
        .uri("/api/invoices")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .insert_header(("Idempotency-Key", "key-6"))
        .set_json(invoice_body("order-cancel"))
        .to_request();
    let created: Value = test::read_body_json(test::call_service(&app, req).await).await;
    let invoice_id = created["invoiceId"].as_str().unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/api/invoices/{invoice_id}/status"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let status: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(status["status"], "PENDING");

    let req = test::TestRequest::post()
        .uri(&format!("/api/invoices/{invoice_id}/cancel"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let cancelled: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(cancelled["status"], "CANCELLED");

    // Cancelling a cancelled invoice is a no-op, not an error.
    let req = test::TestRequest::post()
        .uri(&format!("/api/invoices/{invoice_id}/cancel"))
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    let again: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(again["status"], "CANCELLED");

    let req = test::TestRequest::get()
        .uri("/api/invoices/not-a-real-id")
        .insert_header((API_KEY_HEADER, TEST_API_KEY))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 404);
}
