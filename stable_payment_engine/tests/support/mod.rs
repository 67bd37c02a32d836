//! Shared scaffolding for the engine integration tests: an in-memory
//! database with migrations applied, plus builders for the fixtures most
//! scenarios need.
#![allow(dead_code)]

use chrono::{Duration, Utc};
use spg_common::FiatCents;
use stable_payment_engine::{
    db_types::{
        Address,
        Chain,
        Invoice,
        Merchant,
        NewInvoice,
        NewMerchant,
        PaymentIntent,
        PaymentOption,
        Token,
        TransferEvent,
    },
    traits::{AddressAllocator, TokenPricer, UsdParityPricer},
    InvoiceFlowApi,
    PaymentGatewayDatabase,
    SqliteDatabase,
};

pub const CHAIN: &str = "arbitrum";
pub const TOKEN: &str = "USDT";

/// A single-connection in-memory database. The sequential pool keeps every
/// test hermetic while still exercising the real transaction paths.
pub async fn new_test_db() -> SqliteDatabase {
    let _ = env_logger::try_init();
    let db = SqliteDatabase::new_with_url("sqlite::memory:", 1).await.expect("Error creating in-memory database");
    db.run_migrations().await.expect("Error running DB migrations");
    db
}

pub fn pricer() -> UsdParityPricer {
    UsdParityPricer::usdt_usdc_on(&Chain::from(CHAIN))
}

pub async fn seed_merchant(db: &SqliteDatabase) -> Merchant {
    db.create_merchant(NewMerchant {
        api_key_hash: "a".repeat(64),
        callback_secret: "whsec_test123secret456".into(),
        suppress_info_callbacks: false,
    })
    .await
    .expect("Error creating merchant")
}

pub async fn seed_addresses(db: &SqliteDatabase, addresses: &[&str]) {
    let list: Vec<Address> = addresses.iter().map(|a| Address::from(*a)).collect();
    db.seed_addresses(&Chain::from(CHAIN), &list).await.expect("Error seeding deposit addresses");
}

pub fn usdt_option() -> PaymentOption {
    PaymentOption { token: Token::from(TOKEN), chain: Chain::from(CHAIN) }
}

/// An invoice for `cents` USD expiring `expiry_secs` from now (negative for
/// already-expired fixtures).
pub async fn make_invoice(
    api: &InvoiceFlowApi<SqliteDatabase>,
    merchant_id: i64,
    cents: i64,
    order_id: &str,
    expiry_secs: i64,
) -> Invoice {
    api.create_invoice(NewInvoice {
        merchant_id,
        merchant_order_id: order_id.into(),
        fiat_amount: FiatCents::from(cents),
        currency: "USD".into(),
        callback_url: "https://merchant.example/callback".into(),
        allowed_options: vec![usdt_option()],
        expires_at: Utc::now() + Duration::seconds(expiry_secs),
    })
    .await
    .expect("Error creating invoice")
}

pub async fn make_intent(api: &InvoiceFlowApi<SqliteDatabase>, invoice: &Invoice) -> PaymentIntent {
    let (_, created) = api
        .create_intent(&invoice.invoice_id, usdt_option(), &pricer())
        .await
        .expect("Error creating payment intent");
    created.intent
}

pub fn transfer_event(tx_hash: &str, log_index: i64, to: &Address, amount: i64, block: i64) -> TransferEvent {
    TransferEvent {
        chain: Chain::from(CHAIN),
        tx_hash: tx_hash.into(),
        log_index,
        token: Token::from(TOKEN),
        to: to.clone(),
        amount: amount.into(),
        block_number: block,
        provider_event_id: Some(format!("evt-{tx_hash}-{log_index}")),
    }
}

pub fn quote_for_cents(cents: i64) -> i64 {
    let amount = pricer()
        .quote(FiatCents::from(cents), "USD", &Token::from(TOKEN), &Chain::from(CHAIN))
        .expect("Error quoting");
    amount.value() as i64
}
